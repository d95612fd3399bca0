// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use tokio::sync::mpsc::{Receiver, Sender};

use crate::commands::{AuthToListenerCmd, ListenerToAuthCmd};
use crate::config::Security;
use crate::error::{Error, ErrorKind};
use crate::types::{ListenerId, SessionGid};

#[allow(clippy::module_name_repetitions)]
pub mod file_auth;
pub mod passwd;

use file_auth::FileAuth;

/// Authentication gate invoked during the connect handshake.
///
/// With no password file configured and anonymous access allowed, every
/// request is granted.
#[derive(Debug)]
pub struct AuthApp {
    allow_anonymous: bool,
    file_auth: Option<FileAuth>,

    listener_senders: Vec<(ListenerId, Sender<AuthToListenerCmd>)>,
    listener_receiver: Receiver<ListenerToAuthCmd>,
}

impl AuthApp {
    /// Create the auth app, loading the configured password file.
    ///
    /// # Errors
    ///
    /// Returns error if the password file is invalid.
    pub fn new(
        security: &Security,
        listener_senders: Vec<(ListenerId, Sender<AuthToListenerCmd>)>,
        listener_receiver: Receiver<ListenerToAuthCmd>,
    ) -> Result<Self, Error> {
        let file_auth = if let Some(password_file) = security.password_file() {
            let file_auth = FileAuth::new(password_file).map_err(|err| {
                Error::from_string(
                    ErrorKind::ConfigError,
                    format!("Invalid password file: {password_file:?}, err: {err:?}"),
                )
            })?;
            Some(file_auth)
        } else {
            None
        };

        Ok(Self {
            allow_anonymous: security.allow_anonymous(),
            file_auth,

            listener_senders,
            listener_receiver,
        })
    }

    pub async fn run_loop(&mut self) -> ! {
        loop {
            if let Some(cmd) = self.listener_receiver.recv().await {
                if let Err(err) = self.handle_listener_cmd(cmd).await {
                    log::error!("auth: Failed to handle listener cmd: {err:?}");
                }
            }
        }
    }

    async fn handle_listener_cmd(&mut self, cmd: ListenerToAuthCmd) -> Result<(), Error> {
        match cmd {
            ListenerToAuthCmd::RequestAuth(gid, username, password) => {
                self.on_listener_request_auth(gid, &username, &password)
                    .await
            }
        }
    }

    async fn on_listener_request_auth(
        &mut self,
        gid: SessionGid,
        username: &str,
        password: &[u8],
    ) -> Result<(), Error> {
        let access_granted = self.authenticate(username, password);

        let Some((_listener_id, sender)) = self
            .listener_senders
            .iter()
            .find(|(listener_id, _sender)| *listener_id == gid.listener_id())
        else {
            return Err(Error::from_string(
                ErrorKind::ChannelError,
                format!("auth: No listener sender with id {}", gid.listener_id()),
            ));
        };

        sender
            .send(AuthToListenerCmd::ResponseAuth(
                gid.session_id(),
                access_granted,
            ))
            .await
            .map_err(Into::into)
    }

    fn authenticate(&self, username: &str, password: &[u8]) -> bool {
        if username.is_empty() {
            return self.allow_anonymous;
        }
        match &self.file_auth {
            Some(file_auth) => file_auth.is_match(username, password),
            // No password database; named clients pass only when anonymous
            // access is allowed.
            None => self.allow_anonymous,
        }
    }
}
