// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Listener cmd handlers: connect resolution, publish fan-out, subscription
//! bookkeeping and will handling.

use codec::{
    ConnectAckPacket, ConnectReturnCode, PacketId, PublishPacket, QoS, SubscribeAck,
    SubscribeAckPacket, SubscribePacket, TopicFilter, UnsubscribePacket,
};
use std::cmp::min;

use super::{Dispatcher, RetainChange};
use crate::commands::{
    DispatcherToListenerCmd, DispatcherToMetricsCmd, ListenerToDispatcherCmd, SessionSnapshot,
};
use crate::error::Error;
use crate::types::{LastWill, SessionGid};

impl Dispatcher {
    pub(super) async fn handle_listener_cmd(
        &mut self,
        cmd: ListenerToDispatcherCmd,
    ) -> Result<(), Error> {
        match cmd {
            ListenerToDispatcherCmd::SessionConnected {
                gid,
                client_id,
                clean_session,
                will,
            } => {
                self.on_session_connected(gid, client_id, clean_session, will)
                    .await
            }
            ListenerToDispatcherCmd::Publish(gid, packet) => self.on_publish(gid, packet).await,
            ListenerToDispatcherCmd::Subscribe(gid, packet) => {
                self.on_subscribe(gid, packet).await
            }
            ListenerToDispatcherCmd::Unsubscribe(gid, packet) => {
                self.on_unsubscribe(gid, packet).await
            }
            ListenerToDispatcherCmd::DeliveryFailed(gid, packet_id) => {
                self.on_delivery_failed(gid, packet_id).await
            }
            ListenerToDispatcherCmd::SessionClosed(gid, snapshot) => {
                self.on_session_closed(gid, snapshot).await
            }
        }
    }

    async fn on_session_connected(
        &mut self,
        gid: SessionGid,
        client_id: String,
        clean_session: bool,
        will: Option<LastWill>,
    ) -> Result<(), Error> {
        log::info!("dispatcher: client {client_id:?} connected, clean_session: {clean_session}");

        // If the client id represents a client already connected, possibly
        // through another listener, the existing connection is dropped
        // [MQTT-3.1.4-2].
        if let Some(record) = self.sessions.get(&client_id) {
            if let Some(old_gid) = record.gid() {
                if old_gid != gid {
                    self.clients.remove(&old_gid);
                    self.send_to_listener(
                        old_gid,
                        DispatcherToListenerCmd::Disconnect(old_gid.session_id()),
                    )
                    .await;
                }
            }
        }

        // Reconstruct the session from the persistent store collaborator when
        // it is absent in memory. Store failures never stall a connect.
        let stored = if !clean_session && self.persistence && !self.sessions.contains(&client_id) {
            match self.store.get_session(&client_id) {
                Ok(stored) => stored,
                Err(err) => {
                    log::error!("store: get_session failed: {err}");
                    None
                }
            }
        } else {
            None
        };

        let resolution = self
            .sessions
            .create_or_reuse(&client_id, clean_session, gid, will, stored);
        self.clients.insert(gid, client_id.clone());
        self.send_metrics(DispatcherToMetricsCmd::SessionAdded).await;

        // Re-insert restored subscriptions; for a session resumed in memory
        // this only replaces identical entries.
        for (filter_str, qos) in &resolution.resumed.subscriptions {
            if let Ok(filter) = TopicFilter::parse(filter_str) {
                self.sub_trie.subscribe(&client_id, &filter, *qos);
            }
        }

        let ack_packet =
            ConnectAckPacket::new(resolution.session_present, ConnectReturnCode::Accepted);
        self.send_to_listener(
            gid,
            DispatcherToListenerCmd::ConnectAck(
                gid.session_id(),
                ack_packet,
                resolution.resumed.inflight,
            ),
        )
        .await;

        // Retained messages for every restored subscription go out first,
        // then the offline queue is drained, all before any fresh publish can
        // reach this connection.
        for (filter_str, granted) in &resolution.resumed.subscriptions {
            if let Ok(filter) = TopicFilter::parse(filter_str) {
                self.deliver_retained(gid, &filter, *granted).await;
            }
        }
        for packet in resolution.resumed.queued {
            let bytes = packet.message().len();
            self.send_to_listener(
                gid,
                DispatcherToListenerCmd::Publish(gid.session_id(), packet),
            )
            .await;
            self.send_metrics(DispatcherToMetricsCmd::PublishPacketSent(1, bytes))
                .await;
        }

        self.mirror_session(&client_id);
        Ok(())
    }

    async fn on_publish(&mut self, _gid: SessionGid, packet: PublishPacket) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::PublishPacketReceived(
            1,
            packet.message().len(),
        ))
        .await;

        self.route_publish(packet).await;
        Ok(())
    }

    /// Route an application message: update the retained store, find matching
    /// subscribers and deliver at the downgraded qos.
    ///
    /// Will messages take the same path as client publishes.
    pub(super) async fn route_publish(&mut self, packet: PublishPacket) {
        if packet.retain() {
            self.update_retained(&packet).await;
        }

        // Routed copies never carry the retain flag; only retained-message
        // deliveries to fresh subscriptions do.
        let mut route = packet;
        route.set_retain(false);

        if self.persistence {
            if let Err(err) = self
                .store
                .put_message(route.clone(), Some(self.session_expiry))
            {
                log::error!("store: put_message failed: {err}");
            }
        }

        let subscribers = self.sub_trie.matches(route.topic());
        for (client_id, granted) in subscribers {
            let mut delivery = route.clone();
            // Granted QoS on delivery is min(publish qos, subscription qos).
            delivery.set_qos(min(route.qos(), granted));
            let bytes = delivery.message().len();

            let target = self
                .sessions
                .get(&client_id)
                .and_then(|record| if record.connected() { record.gid() } else { None });
            match target {
                Some(sub_gid) => {
                    self.send_to_listener(
                        sub_gid,
                        DispatcherToListenerCmd::Publish(sub_gid.session_id(), delivery),
                    )
                    .await;
                    self.send_metrics(DispatcherToMetricsCmd::PublishPacketSent(1, bytes))
                        .await;
                }
                None => {
                    let (queued, dropped) = self.sessions.enqueue(&client_id, delivery);
                    if dropped > 0 {
                        log::warn!(
                            "dispatcher: offline queue overflow for {client_id}, \
                             dropped {dropped} oldest"
                        );
                        self.send_metrics(DispatcherToMetricsCmd::PublishPacketDropped(dropped, 0))
                            .await;
                    }
                    if queued {
                        self.mirror_session(&client_id);
                    } else {
                        self.send_metrics(DispatcherToMetricsCmd::PublishPacketDropped(1, bytes))
                            .await;
                    }
                }
            }
        }
    }

    async fn update_retained(&mut self, packet: &PublishPacket) {
        let change = self.retained.insert(packet);
        match change {
            RetainChange::Stored(bytes) => {
                self.send_metrics(DispatcherToMetricsCmd::RetainedMessageAdded(1, bytes))
                    .await;
            }
            RetainChange::Replaced(old_bytes, new_bytes) => {
                self.send_metrics(DispatcherToMetricsCmd::RetainedMessageRemoved(1, old_bytes))
                    .await;
                self.send_metrics(DispatcherToMetricsCmd::RetainedMessageAdded(1, new_bytes))
                    .await;
            }
            RetainChange::Removed(bytes) => {
                self.send_metrics(DispatcherToMetricsCmd::RetainedMessageRemoved(1, bytes))
                    .await;
            }
            RetainChange::None => {}
        }

        if self.persistence {
            let ret = if packet.message().is_empty() {
                self.store.delete_retained(packet.topic())
            } else if let Some(stored) = self.retained.get(packet.topic()) {
                self.store.put_retained(stored.clone())
            } else {
                Ok(())
            };
            if let Err(err) = ret {
                log::error!("store: retained update failed: {err}");
            }
        }
    }

    async fn on_subscribe(&mut self, gid: SessionGid, packet: SubscribePacket) -> Result<(), Error> {
        let Some(client_id) = self.clients.get(&gid).cloned() else {
            log::error!("dispatcher: Subscribe from unknown session: {gid:?}");
            return Ok(());
        };

        // If a Server receives a SUBSCRIBE packet that contains multiple Topic
        // Filters it MUST handle it as if it had received a sequence of
        // multiple SUBSCRIBE packets, combining their responses into a single
        // SUBACK response [MQTT-3.8.4-4].
        let mut ack_vec = Vec::with_capacity(packet.topics().len());
        let mut granted = Vec::new();
        let mut added = 0;
        for topic in packet.topics() {
            match TopicFilter::parse(topic.topic()) {
                Ok(filter) => {
                    if self.sub_trie.subscribe(&client_id, &filter, topic.qos()) {
                        added += 1;
                    }
                    self.sessions
                        .add_subscription(&client_id, topic.topic(), topic.qos());
                    ack_vec.push(SubscribeAck::QoS(topic.qos()));
                    granted.push((filter, topic.qos()));
                }
                Err(err) => {
                    log::error!(
                        "dispatcher: Invalid subscribe topic: {}, err: {:?}",
                        topic.topic(),
                        err
                    );
                    ack_vec.push(SubscribeAck::Failed);
                }
            }
        }
        if added > 0 {
            self.send_metrics(DispatcherToMetricsCmd::SubscriptionsAdded(added))
                .await;
        }

        let ack_packet = SubscribeAckPacket::with_vec(packet.packet_id(), ack_vec);
        self.send_to_listener(
            gid,
            DispatcherToListenerCmd::SubscribeAck(gid.session_id(), ack_packet),
        )
        .await;

        // Retained messages for each newly granted filter are delivered after
        // the SubscribeAck, before any fresh publish matching that filter can
        // be observed on the same connection.
        for (filter, qos) in granted {
            self.deliver_retained(gid, &filter, qos).await;
        }

        self.mirror_session(&client_id);
        Ok(())
    }

    async fn deliver_retained(&mut self, gid: SessionGid, filter: &TopicFilter, granted: QoS) {
        for mut packet in self.retained.matches(filter) {
            packet.set_qos(min(packet.qos(), granted));
            let bytes = packet.message().len();
            self.send_to_listener(
                gid,
                DispatcherToListenerCmd::Publish(gid.session_id(), packet),
            )
            .await;
            self.send_metrics(DispatcherToMetricsCmd::PublishPacketSent(1, bytes))
                .await;
        }
    }

    async fn on_unsubscribe(
        &mut self,
        gid: SessionGid,
        packet: UnsubscribePacket,
    ) -> Result<(), Error> {
        let Some(client_id) = self.clients.get(&gid).cloned() else {
            log::error!("dispatcher: Unsubscribe from unknown session: {gid:?}");
            return Ok(());
        };

        let mut removed = 0;
        for topic in packet.topics() {
            if let Ok(filter) = TopicFilter::parse(topic.as_ref()) {
                if self.sub_trie.unsubscribe(&client_id, &filter) {
                    removed += 1;
                }
            }
            self.sessions.remove_subscription(&client_id, topic.as_ref());
        }
        if removed > 0 {
            self.send_metrics(DispatcherToMetricsCmd::SubscriptionsRemoved(removed))
                .await;
        }

        self.mirror_session(&client_id);
        Ok(())
    }

    async fn on_delivery_failed(
        &mut self,
        gid: SessionGid,
        packet_id: PacketId,
    ) -> Result<(), Error> {
        log::warn!(
            "dispatcher: delivery failed for session {gid:?}, packet id {}",
            packet_id.value()
        );
        self.send_metrics(DispatcherToMetricsCmd::PublishPacketDropped(1, 0))
            .await;
        Ok(())
    }

    async fn on_session_closed(
        &mut self,
        gid: SessionGid,
        snapshot: SessionSnapshot,
    ) -> Result<(), Error> {
        self.send_metrics(DispatcherToMetricsCmd::SessionRemoved).await;
        let Some(client_id) = self.clients.remove(&gid) else {
            // The client id was already taken over by a newer connection.
            return Ok(());
        };

        // After a takeover the record already belongs to the new connection;
        // the stale close must not touch it.
        if let Some(record) = self.sessions.get(&client_id) {
            if record.gid().is_some() && record.gid() != Some(gid) {
                return Ok(());
            }
        }

        let (will, purged_filters) = self.sessions.disconnect(&client_id, snapshot.inflight);

        if let Some(_filters) = purged_filters {
            // Clean session destroyed; drop its subscriptions.
            let removed = self.sub_trie.unsubscribe_client(&client_id);
            if removed > 0 {
                self.send_metrics(DispatcherToMetricsCmd::SubscriptionsRemoved(removed))
                    .await;
            }
            if self.persistence {
                if let Err(err) = self.store.delete_session(&client_id) {
                    log::error!("store: delete_session failed: {err}");
                }
            }
        } else {
            self.mirror_session(&client_id);
        }

        // The will is published through the normal routing pipeline when the
        // connection ended without a Disconnect packet. A graceful disconnect
        // suppresses it.
        if !snapshot.graceful {
            if let Some(will) = will {
                log::info!(
                    "dispatcher: publishing will of {client_id} to {}",
                    will.topic
                );
                match PublishPacket::new(&will.topic, will.qos, &will.message) {
                    Ok(mut packet) => {
                        packet.set_retain(will.retain);
                        self.route_publish(packet).await;
                    }
                    Err(err) => {
                        log::error!("dispatcher: Invalid will message: {err:?}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Mirror the current session record into the persistent store.
    fn mirror_session(&mut self, client_id: &str) {
        if !self.persistence {
            return;
        }
        if let Some(stored) = self.sessions.stored_view(client_id) {
            // Clean sessions are not worth persisting.
            if let Some(record) = self.sessions.get(client_id) {
                if record.clean_session() {
                    return;
                }
            }
            if let Err(err) = self.store.put_session(stored, Some(self.session_expiry)) {
                log::error!("store: put_session failed: {err}");
            }
        }
    }
}
