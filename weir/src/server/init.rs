// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Init server context internal modules.

use tokio::sync::mpsc;

use super::{ServerContext, CHANNEL_CAPACITY};
use crate::auth::AuthApp;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::listener::Listener;
use crate::metrics::Metrics;

impl ServerContext {
    pub(crate) async fn init_modules(&mut self) -> Result<(), Error> {
        log::info!("ServerContext::init_modules()");

        let (listeners_to_dispatcher_sender, listeners_to_dispatcher_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut dispatcher_to_listener_senders = Vec::new();
        let (listeners_to_auth_sender, listeners_to_auth_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut auth_to_listener_senders = Vec::new();

        // Listeners module.
        let mut listener_objs = Vec::new();
        for (listener_id, listener_config) in (0_u32..).zip(self.config.listeners().iter()) {
            let (dispatcher_to_listener_sender, dispatcher_to_listener_receiver) =
                mpsc::channel(CHANNEL_CAPACITY);
            dispatcher_to_listener_senders.push((listener_id, dispatcher_to_listener_sender));

            let (auth_to_listener_sender, auth_to_listener_receiver) =
                mpsc::channel(CHANNEL_CAPACITY);
            auth_to_listener_senders.push((listener_id, auth_to_listener_sender));

            let listener = Listener::bind(
                listener_id,
                listener_config.clone(),
                // dispatcher module
                listeners_to_dispatcher_sender.clone(),
                dispatcher_to_listener_receiver,
                // auth module
                listeners_to_auth_sender.clone(),
                auth_to_listener_receiver,
            )
            .await?;
            listener_objs.push(listener);
        }

        for mut listener in listener_objs {
            tokio::spawn(async move {
                listener.run_loop().await;
            });
        }

        // Auth module.
        let mut auth_app = AuthApp::new(
            self.config.security(),
            auth_to_listener_senders,
            listeners_to_auth_receiver,
        )?;
        tokio::spawn(async move {
            auth_app.run_loop().await;
        });

        // Metrics module.
        let (dispatcher_to_metrics_sender, dispatcher_to_metrics_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut metrics = Metrics::new(
            self.config.general().sys_interval(),
            dispatcher_to_metrics_receiver,
        );
        tokio::spawn(async move {
            metrics.run_loop().await;
        });

        // Dispatcher module.
        let mut dispatcher = Dispatcher::new(
            self.config.storage(),
            dispatcher_to_listener_senders,
            listeners_to_dispatcher_receiver,
            dispatcher_to_metrics_sender,
        );
        tokio::spawn(async move {
            dispatcher.run_loop().await;
        });

        Ok(())
    }
}
