// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Session cmd handlers.

use codec::{ConnectPacket, PacketId, PublishPacket, SubscribePacket, UnsubscribePacket};

use super::Listener;
use crate::commands::{
    ListenerToAuthCmd, ListenerToDispatcherCmd, ListenerToSessionCmd, SessionSnapshot,
    SessionToListenerCmd,
};
use crate::error::Error;
use crate::types::{SessionGid, SessionId};

impl Listener {
    pub(super) fn next_session_id(&mut self) -> SessionId {
        self.current_session_id += 1;
        self.current_session_id
    }

    pub(super) async fn handle_session_cmd(
        &mut self,
        cmd: SessionToListenerCmd,
    ) -> Result<(), Error> {
        match cmd {
            SessionToListenerCmd::Connect(session_id, packet) => {
                self.on_session_connect(session_id, packet).await
            }
            SessionToListenerCmd::Publish(session_id, packet) => {
                self.on_session_publish(session_id, packet).await
            }
            SessionToListenerCmd::Subscribe(session_id, packet) => {
                self.on_session_subscribe(session_id, packet).await
            }
            SessionToListenerCmd::Unsubscribe(session_id, packet) => {
                self.on_session_unsubscribe(session_id, packet).await
            }
            SessionToListenerCmd::DeliveryFailed(session_id, packet_id) => {
                self.on_session_delivery_failed(session_id, packet_id).await
            }
            SessionToListenerCmd::Disconnect(session_id, snapshot) => {
                self.on_session_disconnect(session_id, snapshot).await
            }
        }
    }

    async fn on_session_connect(
        &mut self,
        session_id: SessionId,
        packet: ConnectPacket,
    ) -> Result<(), Error> {
        // If the ClientId represents a Client already connected to the Server
        // then the Server MUST disconnect the existing Client [MQTT-3.1.4-2].
        if let Some(&old_session_id) = self.client_ids.get(packet.client_id()) {
            if old_session_id != session_id {
                if let Err(err) = self.disconnect_session(old_session_id).await {
                    log::error!(
                        "listener: Failed to send disconnect cmd to {old_session_id}, \
                         err: {err:?}"
                    );
                }
            }
        }

        let username = packet.username().to_string();
        let password = packet.password().to_vec();
        self.pending_connects.insert(session_id, packet);

        // Send request to auth app.
        self.auth_sender
            .send(ListenerToAuthCmd::RequestAuth(
                SessionGid::new(self.id, session_id),
                username,
                password,
            ))
            .await
            .map_err(Into::into)
    }

    async fn on_session_publish(
        &mut self,
        session_id: SessionId,
        packet: PublishPacket,
    ) -> Result<(), Error> {
        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::Publish(
                SessionGid::new(self.id, session_id),
                packet,
            ))
            .await
            .map_err(Into::into)
    }

    async fn on_session_subscribe(
        &mut self,
        session_id: SessionId,
        packet: SubscribePacket,
    ) -> Result<(), Error> {
        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::Subscribe(
                SessionGid::new(self.id, session_id),
                packet,
            ))
            .await
            .map_err(Into::into)
    }

    async fn on_session_unsubscribe(
        &mut self,
        session_id: SessionId,
        packet: UnsubscribePacket,
    ) -> Result<(), Error> {
        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::Unsubscribe(
                SessionGid::new(self.id, session_id),
                packet,
            ))
            .await
            .map_err(Into::into)
    }

    async fn on_session_delivery_failed(
        &mut self,
        session_id: SessionId,
        packet_id: PacketId,
    ) -> Result<(), Error> {
        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::DeliveryFailed(
                SessionGid::new(self.id, session_id),
                packet_id,
            ))
            .await
            .map_err(Into::into)
    }

    async fn on_session_disconnect(
        &mut self,
        session_id: SessionId,
        snapshot: SessionSnapshot,
    ) -> Result<(), Error> {
        log::info!("listener: session {session_id} disconnected");
        if self.session_senders.remove(&session_id).is_none() {
            log::error!("listener: Failed to remove sender with session id: {session_id}");
        }
        self.pending_connects.remove(&session_id);

        // Sessions which never completed the connect handshake have no
        // broker-side state to clean up.
        let Some(client_id) = self.session_clients.remove(&session_id) else {
            return Ok(());
        };
        if self.client_ids.get(&client_id) == Some(&session_id) {
            self.client_ids.remove(&client_id);
        }

        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::SessionClosed(
                SessionGid::new(self.id, session_id),
                snapshot,
            ))
            .await
            .map_err(Into::into)
    }

    /// Send disconnect cmd to session.
    pub(super) async fn disconnect_session(&mut self, session_id: SessionId) -> Result<(), Error> {
        let cmd = ListenerToSessionCmd::Disconnect;
        if let Some(session_sender) = self.session_senders.get(&session_id) {
            session_sender.send(cmd).await.map_err(Into::into)
        } else {
            Err(Error::session_error(session_id))
        }
    }
}
