// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{ByteArray, DecodePacket, EncodePacket, Packet, PacketId, PacketType, VarInt};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::interval;

use crate::commands::{ListenerToSessionCmd, SessionSnapshot, SessionToListenerCmd};
use crate::error::{Error, ErrorKind};
use crate::stream::Stream;
use crate::types::SessionId;

mod client;
mod config;
mod inflight;
mod listener;

pub use config::SessionConfig;
pub use inflight::{DeliveryState, InflightDelivery, InflightQueue, Retransmit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Invalid,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// One client connection.
///
/// A session task owns the socket stream: it frames inbound bytes into whole
/// control packets, enforces keep alive and connect timeouts, and runs the
/// outbound QoS 1/2 state machines. Broker wide state lives in the dispatcher;
/// the two talk through the owning listener.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    stream: Stream,

    status: Status,
    client_id: String,
    instant: Instant,
    connect_instant: Instant,

    /// True when a Disconnect packet arrived before the stream closed.
    graceful: bool,

    /// QoS 2 publishes received from this client, waiting for PublishRelease.
    pub_recv_packets: HashSet<PacketId>,

    /// Outbound QoS 1/2 deliveries to this client.
    inflight: InflightQueue,

    sender: Sender<SessionToListenerCmd>,
    receiver: Receiver<ListenerToSessionCmd>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        stream: Stream,
        sender: Sender<SessionToListenerCmd>,
        receiver: Receiver<ListenerToSessionCmd>,
    ) -> Self {
        let inflight = InflightQueue::new(config.max_inflight_messages());
        Self {
            id,
            config,
            stream,

            status: Status::Invalid,
            client_id: String::new(),
            instant: Instant::now(),
            connect_instant: Instant::now(),

            graceful: false,

            pub_recv_packets: HashSet::new(),

            inflight,

            sender,
            receiver,
        }
    }

    pub async fn run_loop(mut self) {
        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        let mut sweep = interval(Duration::from_secs(1));

        loop {
            if self.status == Status::Disconnected {
                break;
            }

            tokio::select! {
                ret = self.stream.read_buf(&mut buf) => {
                    match ret {
                        Ok(0) => {
                            log::info!("session: Stream closed by peer, {}", self.id);
                            break;
                        }
                        Ok(_n_recv) => {
                            if let Err(err) = self.consume_buffer(&mut buf).await {
                                log::error!("session: handle packet failed: {err:?}, {}", self.id);
                                break;
                            }
                        }
                        Err(err) => {
                            log::info!("session: Stream read error: {err:?}, {}", self.id);
                            break;
                        }
                    }
                }
                Some(cmd) = self.receiver.recv() => {
                    if let Err(err) = self.handle_listener_cmd(cmd).await {
                        log::error!("session: Failed to handle listener cmd: {err:?}");
                    }
                },
                _ = sweep.tick() => {
                    if let Err(err) = self.on_sweep_tick().await {
                        log::warn!("session: sweep failed: {err:?}, {}", self.id);
                        break;
                    }
                }
            }
        }

        self.stream.close().await;

        let snapshot = SessionSnapshot {
            graceful: self.graceful,
            inflight: self.inflight.take_all(),
        };
        if let Err(err) = self
            .sender
            .send(SessionToListenerCmd::Disconnect(self.id, snapshot))
            .await
        {
            log::error!(
                "session: Failed to send disconnect cmd to listener, id: {}, err: {:?}",
                self.id,
                err
            );
        }
    }

    /// Split buffered bytes into whole control packets and handle each.
    ///
    /// A packet may span multiple socket reads or WebSocket frames, and one
    /// read may carry several packets, so bytes stay buffered until the
    /// declared remaining length has fully arrived.
    async fn consume_buffer(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        loop {
            match Self::packet_length(buf)? {
                None => return Ok(()),
                Some(packet_len) => {
                    let packet_bytes: Vec<u8> = buf.drain(..packet_len).collect();
                    self.handle_client_packet(&packet_bytes).await?;
                    if self.status == Status::Disconnected {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Byte length of the first complete packet in `buf`, or None if more
    /// bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns error if the remaining length field itself is malformed.
    fn packet_length(buf: &[u8]) -> Result<Option<usize>, Error> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Check whether the var int field is complete before decoding it.
        let mut var_int_len = 0;
        for byte in buf.iter().skip(1).take(4) {
            var_int_len += 1;
            if byte & 0x80 == 0 {
                let mut ba = ByteArray::new(&buf[1..=var_int_len]);
                let remaining_length = VarInt::decode(&mut ba)?;
                return Ok(Some(1 + var_int_len + remaining_length.value()));
            }
        }

        if var_int_len == 4 {
            // Four bytes read and the continuation bit is still set.
            return Err(Error::new(
                ErrorKind::DecodeError,
                "session: Invalid remaining length field",
            ));
        }
        Ok(None)
    }

    /// Enforce connect timeout, keep alive, and the retransmission policy.
    async fn on_sweep_tick(&mut self) -> Result<(), Error> {
        // If the Server does not receive a CONNECT Packet within a reasonable
        // amount of time after the Network Connection is established, the
        // Server SHOULD close the connection.
        if self.status == Status::Invalid
            && self.config.connect_timeout() > 0
            && self.connect_instant.elapsed().as_secs() > self.config.connect_timeout()
        {
            return Err(Error::new(
                ErrorKind::TimeoutError,
                "session: No Connect packet in time",
            ));
        }

        // From [MQTT-3.1.2-24]
        //
        // If the Keep Alive value is non-zero and the Server does not receive
        // a Control Packet from the Client within one and a half times the
        // Keep Alive time period, it MUST disconnect the Network Connection to
        // the Client as if the network had failed.
        //
        // A Keep Alive value of zero (0) has the effect of turning off the
        // keep alive mechanism.
        if self.status == Status::Connected
            && self.config.keep_alive() > 0
            && self.instant.elapsed().as_secs() > self.config.keep_alive()
        {
            log::warn!("session: keep_alive timeout reached, disconnect client!");
            // The will message is published as for any abrupt disconnect.
            return Err(Error::new(
                ErrorKind::TimeoutError,
                "session: Keep alive lapsed",
            ));
        }

        if self.status == Status::Connected {
            self.retry_inflight().await?;
        }
        Ok(())
    }

    async fn retry_inflight(&mut self) -> Result<(), Error> {
        let (retransmits, expired) = self
            .inflight
            .scan_retries(self.config.retry_interval(), self.config.max_retries());

        for retransmit in retransmits {
            match retransmit {
                Retransmit::Publish(packet) => self.send(packet).await?,
                Retransmit::Release(packet) => self.send(packet).await?,
            }
        }

        for packet_id in expired {
            log::warn!(
                "session: max retries exceeded for packet {}, client {}",
                packet_id.value(),
                self.client_id
            );
            self.sender
                .send(SessionToListenerCmd::DeliveryFailed(self.id, packet_id))
                .await?;
        }
        Ok(())
    }

    /// Reset activity instant when a packet is received from the client.
    fn reset_instant(&mut self) {
        self.instant = Instant::now();
    }

    async fn send<P: EncodePacket + Packet>(&mut self, packet: P) -> Result<(), Error> {
        // The first packet sent from the Server to the Client MUST be
        // a CONNACK Packet [MQTT-3.2.0-1].
        if self.status == Status::Connecting && packet.packet_type() != PacketType::ConnectAck {
            log::error!(
                "session: ConnectAck is not the first packet to send: {:?}",
                packet.packet_type()
            );
        }

        if self.status == Status::Disconnected {
            return Err(Error::from_string(
                ErrorKind::SendError,
                format!(
                    "session: Cannot send packet when stream has been disconnected: {:?}",
                    packet.packet_type()
                ),
            ));
        }

        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write(&buf).await.map(drop)?;
        Ok(())
    }

    /// Flag the session so that the run loop tears the stream down.
    ///
    /// MQTT 3.1.1 has no server-to-client Disconnect packet, protocol errors
    /// are answered by closing the network connection.
    fn close_connection(&mut self) {
        self.status = Status::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_length_needs_more_bytes() {
        assert_eq!(Session::packet_length(&[]).unwrap(), None);
        assert_eq!(Session::packet_length(&[0x30]).unwrap(), None);
        // Continuation bit set, second length byte missing.
        assert_eq!(Session::packet_length(&[0x30, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_packet_length_complete() {
        // PINGREQ.
        assert_eq!(Session::packet_length(&[0xc0, 0x00]).unwrap(), Some(2));
        // Publish with 19 remaining bytes; payload not yet buffered.
        assert_eq!(Session::packet_length(&[0x30, 0x13, 0x00]).unwrap(), Some(21));
        // Two byte length field.
        assert_eq!(
            Session::packet_length(&[0x30, 0x92, 0x01]).unwrap(),
            Some(1 + 2 + 146)
        );
    }

    #[test]
    fn test_packet_length_invalid_var_int() {
        let buf = [0x30, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert!(Session::packet_length(&buf).is_err());
    }
}
