// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Handles commands and new connections

use std::time::Duration;
use tokio::sync::mpsc;

use super::{Listener, CHANNEL_CAPACITY};
use crate::session::{Session, SessionConfig};
use crate::stream::Stream;

impl Listener {
    /// # Panics
    /// Raise panic if failed to unpack channel receivers.
    pub async fn run_loop(&mut self) -> ! {
        // Take ownership of mpsc receiver or else tokio select will raise error.
        let mut session_receiver = self
            .session_receiver
            .take()
            .expect("Invalid session receiver");
        let mut dispatcher_receiver = self
            .dispatcher_receiver
            .take()
            .expect("Invalid dispatcher receiver");
        let mut auth_receiver = self.auth_receiver.take().expect("Invalid auth receiver");

        loop {
            tokio::select! {
                ret = self.accept() => {
                    match ret {
                        Ok(stream) => self.new_connection(stream).await,
                        Err(err) => log::error!("listener: accept failed: {err:?}"),
                    }
                },

                Some(cmd) = session_receiver.recv() => {
                    if let Err(err) = self.handle_session_cmd(cmd).await {
                        log::error!("listener: handle session cmd failed: {err:?}");
                    }
                },

                Some(cmd) = dispatcher_receiver.recv() => {
                    if let Err(err) = self.handle_dispatcher_cmd(cmd).await {
                        log::error!("listener: handle dispatcher cmd failed: {err:?}");
                    }
                }

                Some(cmd) = auth_receiver.recv() => {
                    if let Err(err) = self.handle_auth_cmd(cmd).await {
                        log::error!("listener: handle auth cmd failed: {err:?}");
                    }
                }
            }
        }
    }

    async fn new_connection(&mut self, mut stream: Stream) {
        // When the number of active connections reaches the limit, the
        // accepted socket is closed immediately without a ConnectAck packet.
        let maximum_connections = self.config.maximum_connections();
        if maximum_connections > 0 && self.session_senders.len() >= maximum_connections {
            log::warn!(
                "listener: Maximum connections ({maximum_connections}) reached, \
                 closing new connection"
            );
            stream.close().await;
            return;
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let session_id = self.next_session_id();
        self.session_senders.insert(session_id, sender);
        let session_config = SessionConfig::new(
            u64::from(self.config.keep_alive()),
            u64::from(self.config.connect_timeout()),
            self.config.allow_empty_client_id(),
            usize::from(self.config.maximum_inflight_messages()),
            Duration::from_secs(self.config.retry_interval()),
            self.config.max_retries(),
        );
        let session = Session::new(
            session_id,
            session_config,
            stream,
            self.session_sender.clone(),
            receiver,
        );
        tokio::spawn(session.run_loop());
    }
}
