// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Handles client packets

use codec::utils::random_client_id;
use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodeError, DecodePacket,
    FixedHeader, PacketType, PingRequestPacket, PingResponsePacket, ProtocolLevel,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, QoS, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};

use super::{Session, Status};
use crate::commands::SessionToListenerCmd;
use crate::error::{Error, ErrorKind};

impl Session {
    pub(super) async fn handle_client_packet(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let fixed_header = match FixedHeader::decode(&mut ba) {
            Ok(fixed_header) => fixed_header,
            Err(err) => {
                // Close the network connection if the packet is malformed
                // [MQTT-4.8.0-1].
                log::error!("session: Invalid packet: {err:?}");
                self.close_connection();
                return Ok(());
            }
        };

        // The framing loop only hands over whole packets, so the declared
        // remaining length must agree with the buffered byte count.
        if fixed_header.bytes() + fixed_header.remaining_length() != buf.len() {
            log::error!("session: Remaining length disagrees with buffered bytes");
            self.close_connection();
            return Ok(());
        }

        self.reset_instant();

        if fixed_header.packet_type() == PacketType::Connect {
            return self.on_client_connect(buf).await;
        }

        // Any packet received before the connect handshake finished causes
        // immediate disconnect.
        if self.status != Status::Connected {
            log::error!(
                "session: Got {:?} before connect handshake finished",
                fixed_header.packet_type()
            );
            self.close_connection();
            return Ok(());
        }

        match fixed_header.packet_type() {
            PacketType::PingRequest => self.on_client_ping(buf).await,
            PacketType::Publish { .. } => self.on_client_publish(buf).await,
            PacketType::PublishAck => self.on_client_publish_ack(buf),
            PacketType::PublishReceived => self.on_client_publish_received(buf).await,
            PacketType::PublishRelease => self.on_client_publish_release(buf).await,
            PacketType::PublishComplete => self.on_client_publish_complete(buf),
            PacketType::Subscribe => self.on_client_subscribe(buf).await,
            PacketType::Unsubscribe => self.on_client_unsubscribe(buf).await,
            PacketType::Disconnect => self.on_client_disconnect(),
            t => {
                // Server-originated packet types are never valid from a client.
                log::error!("session: Unexpected packet from client: {t:?}");
                self.close_connection();
                Ok(())
            }
        }
    }

    async fn reject_client_id(&mut self) -> Result<(), Error> {
        // If a server sends a CONNACK packet containing a non-zero return code
        // it MUST set Session Present to 0 [MQTT-3.2.2-4].
        let ack_packet = ConnectAckPacket::new(false, ConnectReturnCode::IdentifierRejected);
        self.send(ack_packet).await?;
        self.close_connection();
        Ok(())
    }

    async fn on_client_connect(&mut self, buf: &[u8]) -> Result<(), Error> {
        // The Server MUST process a second CONNECT Packet sent from a Client
        // as a protocol violation and disconnect the Client [MQTT-3.1.0-2].
        if self.status != Status::Invalid {
            self.close_connection();
            return Err(Error::new(
                ErrorKind::DecodeError,
                "session: Invalid status, got a second CONNECT packet!",
            ));
        }

        let mut ba = ByteArray::new(buf);
        let mut packet = match ConnectPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => match err {
                // The Server MUST respond to the CONNECT Packet with a CONNACK
                // return code 0x01 (unacceptable protocol level) and then
                // disconnect the Client if the Protocol Level is not supported
                // by the Server [MQTT-3.1.2-2].
                DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel => {
                    let ack_packet =
                        ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
                    self.send(ack_packet).await?;
                    self.close_connection();
                    return Err(err.into());
                }
                DecodeError::InvalidClientId => {
                    self.reject_client_id().await?;
                    return Err(err.into());
                }
                _ => {
                    // The Server MUST validate that the CONNECT Packet conforms
                    // to section 3.1 and close the Network Connection without
                    // sending a CONNACK if it does not conform [MQTT-3.1.4-1].
                    self.close_connection();
                    return Err(err.into());
                }
            },
        };

        // Only level 4 (3.1.1) is spoken here.
        if packet.protocol_level() != ProtocolLevel::V311 {
            let ack_packet = ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
            self.send(ack_packet).await?;
            self.close_connection();
            return Ok(());
        }

        // A Server MAY allow a Client to supply a ClientId that has a length
        // of zero bytes; the Server MUST then treat this as a special case and
        // assign a unique ClientId to that Client [MQTT-3.1.3-6].
        if packet.client_id().is_empty() {
            if self.config.allow_empty_client_id() {
                let new_client_id = random_client_id();
                // No need to catch errors as the generated id is always valid.
                let _ret = packet.set_client_id(&new_client_id);
            } else {
                return self.reject_client_id().await;
            }
        }
        self.client_id = packet.client_id().to_string();

        // Update keep_alive timer.
        //
        // If the Keep Alive value is non-zero and the Server does not receive
        // a Control Packet from the Client within one and a half times the
        // Keep Alive time period, it MUST disconnect [MQTT-3.1.2-24].
        if packet.keep_alive() > 0 {
            #[allow(clippy::cast_possible_truncation)]
            #[allow(clippy::cast_sign_loss)]
            let keep_alive = (f64::from(packet.keep_alive()) * 1.5) as u64;
            self.config.set_keep_alive(keep_alive);
        } else {
            self.config.set_keep_alive(0);
        }

        // Send the connect packet to the listener, which drives authentication
        // and session resolution.
        self.status = Status::Connecting;
        self.sender
            .send(SessionToListenerCmd::Connect(self.id, packet))
            .await
            .map(drop)?;
        Ok(())
    }

    async fn on_client_ping(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let _packet = PingRequestPacket::decode(&mut ba)?;

        let ping_resp_packet = PingResponsePacket::new();
        self.send(ping_resp_packet).await
    }

    async fn on_client_publish(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = match PublishPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => {
                // Covers malformed flags, wildcard characters in the topic
                // name, and a zero packet identifier.
                log::error!("session: Invalid publish packet: {err:?}, do disconnect!");
                self.close_connection();
                return Ok(());
            }
        };

        match packet.qos() {
            QoS::AtMostOnce => {
                self.sender
                    .send(SessionToListenerCmd::Publish(self.id, packet))
                    .await
                    .map(drop)?;
            }
            QoS::AtLeastOnce => {
                let packet_id = packet.packet_id();
                self.sender
                    .send(SessionToListenerCmd::Publish(self.id, packet))
                    .await
                    .map(drop)?;
                // In the QoS 1 delivery protocol, the Receiver MUST respond
                // with a PUBACK Packet containing the Packet Identifier of the
                // incoming PUBLISH Packet [MQTT-4.3.2-2].
                let ack_packet = PublishAckPacket::new(packet_id);
                self.send(ack_packet).await?;
            }
            QoS::ExactOnce => {
                let packet_id = packet.packet_id();
                if self.pub_recv_packets.contains(&packet_id) {
                    // Already routed; acknowledge receipt again without
                    // re-routing the message.
                    let ack_packet = PublishReceivedPacket::new(packet_id);
                    return self.send(ack_packet).await;
                }

                if self.pub_recv_packets.len() >= self.config.max_inflight_messages() {
                    log::error!(
                        "session: Too many unreleased qos=2 messages, disconnect client!"
                    );
                    self.close_connection();
                    return Ok(());
                }

                self.pub_recv_packets.insert(packet_id);
                self.sender
                    .send(SessionToListenerCmd::Publish(self.id, packet))
                    .await
                    .map(drop)?;
                let ack_packet = PublishReceivedPacket::new(packet_id);
                self.send(ack_packet).await?;
            }
        }
        Ok(())
    }

    /// PubAck from client finishes an outbound QoS 1 delivery.
    fn on_client_publish_ack(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = PublishAckPacket::decode(&mut ba)?;
        if self.inflight.on_pub_ack(packet.packet_id()).is_none() {
            log::warn!(
                "session: PubAck for unknown packet id {}, client {}",
                packet.packet_id().value(),
                self.client_id
            );
        }
        Ok(())
    }

    /// PubRec from client moves an outbound QoS 2 delivery to the release
    /// phase.
    async fn on_client_publish_received(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = PublishReceivedPacket::decode(&mut ba)?;
        if self.inflight.on_pub_rec(packet.packet_id()) {
            let release_packet = PublishReleasePacket::new(packet.packet_id());
            self.send(release_packet).await?;
        }
        Ok(())
    }

    /// PubComp from client finishes an outbound QoS 2 delivery.
    fn on_client_publish_complete(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = PublishCompletePacket::decode(&mut ba)?;
        if self.inflight.on_pub_comp(packet.packet_id()).is_none() {
            log::warn!(
                "session: PubComp for unknown packet id {}, client {}",
                packet.packet_id().value(),
                self.client_id
            );
        }
        Ok(())
    }

    async fn on_client_publish_release(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = match PublishReleasePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => {
                // Bits 3,2,1 and 0 of the fixed header in the PUBREL Control
                // Packet are reserved and MUST be set to 0,0,1 and 0. The
                // Server MUST treat any other value as malformed and close the
                // Network Connection [MQTT-3.6.1-1].
                log::error!("session: Invalid publish release packet: {err:?}");
                self.close_connection();
                return Ok(());
            }
        };

        self.pub_recv_packets.remove(&packet.packet_id());
        let ack_packet = PublishCompletePacket::new(packet.packet_id());
        self.send(ack_packet).await
    }

    async fn on_client_subscribe(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = match SubscribePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => {
                // Malformed flag bits [MQTT-3.8.1-1], an empty topic filter
                // list [MQTT-3.8.3-3] and reserved QoS bits [MQTT-3-8.3-4]
                // all close the network connection.
                log::error!("session: Invalid subscribe packet: {err:?}, do disconnect!");
                self.close_connection();
                return Ok(());
            }
        };

        self.sender
            .send(SessionToListenerCmd::Subscribe(self.id, packet))
            .await
            .map(drop)?;
        Ok(())
    }

    async fn on_client_unsubscribe(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = match UnsubscribePacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err) => {
                log::error!("session: Invalid unsubscribe packet: {err:?}, do disconnect!");
                self.close_connection();
                return Ok(());
            }
        };
        let packet_id = packet.packet_id();

        self.sender
            .send(SessionToListenerCmd::Unsubscribe(self.id, packet))
            .await
            .map(drop)?;

        // The UNSUBACK Packet MUST have the same Packet Identifier as the
        // UNSUBSCRIBE Packet [MQTT-3.10.4-5].
        let unsubscribe_ack_packet = UnsubscribeAckPacket::new(packet_id);
        self.send(unsubscribe_ack_packet).await
    }

    /// Handle disconnect request from client.
    ///
    /// On receipt of DISCONNECT the Server MUST discard any Will Message
    /// associated with the current connection without publishing it
    /// [MQTT-3.14.4-3].
    fn on_client_disconnect(&mut self) -> Result<(), Error> {
        self.graceful = true;
        self.close_connection();
        Ok(())
    }
}
