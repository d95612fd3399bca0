// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Handles commands from listener.

use codec::{ConnectAckPacket, ConnectReturnCode, PublishPacket, QoS, SubscribeAckPacket};

use super::{DeliveryState, InflightDelivery, Retransmit, Session, Status};
use crate::commands::{ListenerToSessionCmd, SessionToListenerCmd};
use crate::error::Error;

impl Session {
    pub(super) async fn handle_listener_cmd(
        &mut self,
        cmd: ListenerToSessionCmd,
    ) -> Result<(), Error> {
        match cmd {
            ListenerToSessionCmd::ConnectAck(packet, inflight) => {
                self.on_listener_connect_ack(packet, inflight).await
            }
            ListenerToSessionCmd::Publish(packet) => self.on_listener_publish(packet).await,
            ListenerToSessionCmd::SubscribeAck(packet) => {
                self.on_listener_subscribe_ack(packet).await
            }
            ListenerToSessionCmd::Disconnect => self.on_listener_disconnect(),
        }
    }

    async fn on_listener_connect_ack(
        &mut self,
        packet: ConnectAckPacket,
        inflight: Vec<InflightDelivery>,
    ) -> Result<(), Error> {
        // Send connect ack first, then update status.
        let return_code = packet.return_code();
        self.send(packet).await?;

        if return_code == ConnectReturnCode::Accepted {
            self.status = Status::Connected;
        } else {
            // If a server sends a CONNACK packet containing a non-zero return
            // code it MUST then close the Network Connection [MQTT-3.2.2-5].
            self.graceful = true;
            self.close_connection();
            return Ok(());
        }

        // Retransmit deliveries stashed from the previous connection of this
        // persistent session, before any fresh traffic is handled.
        for delivery in inflight {
            let retransmit = match delivery.state {
                DeliveryState::AwaitingPubAck | DeliveryState::AwaitingPubRec => {
                    let mut publish = delivery.packet.clone();
                    let _ret = publish.set_dup(true);
                    Retransmit::Publish(publish)
                }
                DeliveryState::AwaitingPubComp => Retransmit::Release(
                    codec::PublishReleasePacket::new(delivery.packet_id),
                ),
            };
            self.inflight.resume(delivery);
            match retransmit {
                Retransmit::Publish(publish) => self.send(publish).await?,
                Retransmit::Release(release) => self.send(release).await?,
            }
        }
        Ok(())
    }

    /// Deliver an application message to this client.
    ///
    /// The dispatcher already downgraded the qos to the granted maximum; a
    /// packet identifier is allocated here, where the inflight window lives.
    async fn on_listener_publish(&mut self, mut packet: PublishPacket) -> Result<(), Error> {
        if packet.qos() == QoS::AtMostOnce {
            return self.send(packet).await;
        }

        let packet_id = match self.inflight.alloc_packet_id(&self.pub_recv_packets) {
            Ok(packet_id) => packet_id,
            Err(err) => {
                // Fail this delivery only; other subscribers are not affected.
                log::warn!(
                    "session: Failed to allocate packet id for {}: {err:?}",
                    self.client_id
                );
                self.sender
                    .send(SessionToListenerCmd::DeliveryFailed(
                        self.id,
                        codec::PacketId::new(0),
                    ))
                    .await
                    .map(drop)?;
                return Ok(());
            }
        };

        packet.set_packet_id(packet_id);
        self.inflight
            .push(InflightDelivery::new(packet_id, packet.clone()));
        self.send(packet).await
    }

    async fn on_listener_subscribe_ack(
        &mut self,
        packet: SubscribeAckPacket,
    ) -> Result<(), Error> {
        // When the Server receives a SUBSCRIBE Packet from a Client, the Server
        // MUST respond with a SUBACK Packet [MQTT-3.8.4-1] with the same Packet
        // Identifier [MQTT-3.8.4-2].
        self.send(packet).await
    }

    /// Another connection took over this client id; the current stream is
    /// closed without publishing the will.
    fn on_listener_disconnect(&mut self) -> Result<(), Error> {
        self.graceful = true;
        self.close_connection();
        Ok(())
    }
}
