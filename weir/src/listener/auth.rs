// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Auth cmd handlers.

use codec::{ConnectAckPacket, ConnectReturnCode};

use super::Listener;
use crate::commands::{AuthToListenerCmd, ListenerToDispatcherCmd, ListenerToSessionCmd};
use crate::error::Error;
use crate::types::{LastWill, SessionGid, SessionId};

impl Listener {
    pub(super) async fn handle_auth_cmd(&mut self, cmd: AuthToListenerCmd) -> Result<(), Error> {
        match cmd {
            AuthToListenerCmd::ResponseAuth(session_id, access_granted) => {
                self.on_auth_response(session_id, access_granted).await
            }
        }
    }

    async fn on_auth_response(
        &mut self,
        session_id: SessionId,
        access_granted: bool,
    ) -> Result<(), Error> {
        let Some(packet) = self.pending_connects.remove(&session_id) else {
            // Stream already closed while the auth request was pending.
            log::warn!("listener: No pending connect for session {session_id}");
            return Ok(());
        };

        if !access_granted {
            log::info!(
                "listener: auth rejected for client {:?}",
                packet.client_id()
            );
            let ack_packet =
                ConnectAckPacket::new(false, ConnectReturnCode::MalformedUsernamePassword);
            let cmd = ListenerToSessionCmd::ConnectAck(ack_packet, Vec::new());
            if let Some(session_sender) = self.session_senders.get(&session_id) {
                return session_sender.send(cmd).await.map_err(Into::into);
            }
            return Err(Error::session_error(session_id));
        }

        let client_id = packet.client_id().to_string();
        self.client_ids.insert(client_id.clone(), session_id);
        self.session_clients.insert(session_id, client_id.clone());

        let will = if packet.connect_flags().will() {
            packet.will_topic().map(|topic| LastWill {
                topic: topic.to_string(),
                message: packet.will_message().to_vec(),
                qos: packet.connect_flags().will_qos(),
                retain: packet.connect_flags().will_retain(),
            })
        } else {
            None
        };

        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::SessionConnected {
                gid: SessionGid::new(self.id, session_id),
                client_id,
                clean_session: packet.connect_flags().clean_session(),
                will,
            })
            .await
            .map_err(Into::into)
    }
}
