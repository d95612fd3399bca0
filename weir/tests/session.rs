// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Drives a session task over a real socket pair.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, DisconnectPacket,
    EncodePacket, PacketId, PingRequestPacket, PingResponsePacket, PublishAckPacket,
    PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS,
};
use weir::commands::{ListenerToSessionCmd, SessionToListenerCmd};
use weir::session::{Session, SessionConfig};
use weir::stream::Stream;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestClient {
    socket: TcpStream,
    to_session: mpsc::Sender<ListenerToSessionCmd>,
    from_session: mpsc::Receiver<SessionToListenerCmd>,
}

impl TestClient {
    async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _address) = listener.accept().await.unwrap();

        let (session_sender, from_session) = mpsc::channel(32);
        let (to_session, session_receiver) = mpsc::channel(32);
        let config = SessionConfig::new(60, 10, false, 32, Duration::from_secs(30), 3);
        let session = Session::new(
            1,
            config,
            Stream::Mqtt(server_stream),
            session_sender,
            session_receiver,
        );
        tokio::spawn(session.run_loop());

        Self {
            socket,
            to_session,
            from_session,
        }
    }

    async fn send<P: EncodePacket>(&mut self, packet: &P) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        self.socket.write_all(&buf).await.unwrap();
    }

    /// Read one whole control packet from the socket.
    async fn read_packet(&mut self) -> Vec<u8> {
        let mut packet = vec![0_u8; 1];
        timeout(RECV_TIMEOUT, self.socket.read_exact(&mut packet))
            .await
            .unwrap()
            .unwrap();

        let mut remaining: usize = 0;
        let mut multiplier: usize = 1;
        loop {
            let mut byte = [0_u8; 1];
            timeout(RECV_TIMEOUT, self.socket.read_exact(&mut byte))
                .await
                .unwrap()
                .unwrap();
            packet.push(byte[0]);
            remaining += usize::from(byte[0] & 0x7f) * multiplier;
            multiplier *= 128;
            if byte[0] & 0x80 == 0 {
                break;
            }
        }

        let body_start = packet.len();
        packet.resize(body_start + remaining, 0);
        if remaining > 0 {
            timeout(RECV_TIMEOUT, self.socket.read_exact(&mut packet[body_start..]))
                .await
                .unwrap()
                .unwrap();
        }
        packet
    }

    async fn recv_cmd(&mut self) -> SessionToListenerCmd {
        timeout(RECV_TIMEOUT, self.from_session.recv())
            .await
            .expect("timed out waiting for session cmd")
            .expect("session channel closed")
    }

    /// Run the connect handshake, acting as both client and listener.
    async fn connect(&mut self, client_id: &str) {
        let packet = ConnectPacket::new(client_id).unwrap();
        self.send(&packet).await;

        match self.recv_cmd().await {
            SessionToListenerCmd::Connect(session_id, packet) => {
                assert_eq!(session_id, 1);
                assert_eq!(packet.client_id(), client_id);
            }
            cmd => panic!("expected connect cmd, got {cmd:?}"),
        }

        let ack = ConnectAckPacket::new(false, ConnectReturnCode::Accepted);
        self.to_session
            .send(ListenerToSessionCmd::ConnectAck(ack, Vec::new()))
            .await
            .unwrap();

        let bytes = self.read_packet().await;
        let mut ba = ByteArray::new(&bytes);
        let ack = ConnectAckPacket::decode(&mut ba).unwrap();
        assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let mut client = TestClient::new().await;
    client.connect("pinger").await;

    client.send(&PingRequestPacket::new()).await;
    let bytes = client.read_packet().await;
    let mut ba = ByteArray::new(&bytes);
    assert!(PingResponsePacket::decode(&mut ba).is_ok());
}

#[tokio::test]
async fn test_connect_must_be_first() {
    let mut client = TestClient::new().await;

    // A publish before the connect handshake closes the stream.
    let packet = PublishPacket::new("a/b", QoS::AtMostOnce, &[0x01]).unwrap();
    client.send(&packet).await;

    match client.recv_cmd().await {
        SessionToListenerCmd::Disconnect(_session_id, snapshot) => {
            assert!(!snapshot.graceful);
        }
        cmd => panic!("expected disconnect cmd, got {cmd:?}"),
    }
}

#[tokio::test]
async fn test_inbound_qos1_gets_ack() {
    let mut client = TestClient::new().await;
    client.connect("pub1").await;

    let mut packet = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
    packet.set_packet_id(PacketId::new(7));
    client.send(&packet).await;

    match client.recv_cmd().await {
        SessionToListenerCmd::Publish(_session_id, packet) => {
            assert_eq!(packet.packet_id(), PacketId::new(7));
        }
        cmd => panic!("expected publish cmd, got {cmd:?}"),
    }

    let bytes = client.read_packet().await;
    let mut ba = ByteArray::new(&bytes);
    let ack = PublishAckPacket::decode(&mut ba).unwrap();
    assert_eq!(ack.packet_id(), PacketId::new(7));
}

#[tokio::test]
async fn test_inbound_qos2_routes_exactly_once() {
    let mut client = TestClient::new().await;
    client.connect("pub2").await;

    let mut packet = PublishPacket::new("a/b", QoS::ExactOnce, &[0x02]).unwrap();
    packet.set_packet_id(PacketId::new(9));
    client.send(&packet).await;

    // First transmission is routed once and acknowledged with PubRec.
    match client.recv_cmd().await {
        SessionToListenerCmd::Publish(_session_id, packet) => {
            assert_eq!(packet.packet_id(), PacketId::new(9));
        }
        cmd => panic!("expected publish cmd, got {cmd:?}"),
    }
    let bytes = client.read_packet().await;
    let mut ba = ByteArray::new(&bytes);
    assert_eq!(
        PublishReceivedPacket::decode(&mut ba).unwrap().packet_id(),
        PacketId::new(9)
    );

    // Duplicate delivery: PubRec again, but no second routing.
    packet.set_dup(true).unwrap();
    client.send(&packet).await;
    let bytes = client.read_packet().await;
    let mut ba = ByteArray::new(&bytes);
    assert_eq!(
        PublishReceivedPacket::decode(&mut ba).unwrap().packet_id(),
        PacketId::new(9)
    );
    assert!(client.from_session.try_recv().is_err());

    // Release finishes the exchange with PubComp.
    client.send(&PublishReleasePacket::new(PacketId::new(9))).await;
    let bytes = client.read_packet().await;
    let mut ba = ByteArray::new(&bytes);
    assert_eq!(
        PublishCompletePacket::decode(&mut ba).unwrap().packet_id(),
        PacketId::new(9)
    );
}

#[tokio::test]
async fn test_outbound_qos1_allocates_packet_id() {
    let mut client = TestClient::new().await;
    client.connect("sub1").await;

    let packet = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
    client
        .to_session
        .send(ListenerToSessionCmd::Publish(packet))
        .await
        .unwrap();

    let bytes = client.read_packet().await;
    let mut ba = ByteArray::new(&bytes);
    let delivered = PublishPacket::decode(&mut ba).unwrap();
    assert_eq!(delivered.qos(), QoS::AtLeastOnce);
    assert_ne!(delivered.packet_id(), PacketId::new(0));
    assert_eq!(delivered.message(), &[0x01]);

    // Acknowledge; the id becomes free and the next delivery moves on.
    client
        .send(&PublishAckPacket::new(delivered.packet_id()))
        .await;

    let packet = PublishPacket::new("a/c", QoS::AtLeastOnce, &[0x02]).unwrap();
    client
        .to_session
        .send(ListenerToSessionCmd::Publish(packet))
        .await
        .unwrap();
    let bytes = client.read_packet().await;
    let mut ba = ByteArray::new(&bytes);
    let second = PublishPacket::decode(&mut ba).unwrap();
    assert_ne!(second.packet_id(), PacketId::new(0));
    assert_ne!(second.packet_id(), delivered.packet_id());
}

#[tokio::test]
async fn test_graceful_disconnect_is_flagged() {
    let mut client = TestClient::new().await;
    client.connect("bye").await;

    client.send(&DisconnectPacket::new()).await;
    match client.recv_cmd().await {
        SessionToListenerCmd::Disconnect(_session_id, snapshot) => {
            assert!(snapshot.graceful);
            assert!(snapshot.inflight.is_empty());
        }
        cmd => panic!("expected disconnect cmd, got {cmd:?}"),
    }
}

#[tokio::test]
async fn test_abrupt_close_is_not_graceful() {
    let mut client = TestClient::new().await;
    client.connect("gone").await;

    drop(client.socket);
    let cmd = timeout(RECV_TIMEOUT, client.from_session.recv())
        .await
        .expect("timed out waiting for session cmd")
        .expect("session channel closed");
    match cmd {
        SessionToListenerCmd::Disconnect(_session_id, snapshot) => {
            assert!(!snapshot.graceful);
        }
        cmd => panic!("expected disconnect cmd, got {cmd:?}"),
    }
}

#[tokio::test]
async fn test_unacknowledged_delivery_is_stashed_at_close() {
    let mut client = TestClient::new().await;
    client.connect("s1").await;

    let packet = PublishPacket::new("q/1", QoS::AtLeastOnce, &[0x01]).unwrap();
    client
        .to_session
        .send(ListenerToSessionCmd::Publish(packet))
        .await
        .unwrap();
    let _delivered = client.read_packet().await;

    // Stream drops before PubAck arrives; the delivery must come back in the
    // snapshot for retransmission on reconnect.
    drop(client.socket);
    let cmd = timeout(RECV_TIMEOUT, client.from_session.recv())
        .await
        .expect("timed out waiting for session cmd")
        .expect("session channel closed");
    match cmd {
        SessionToListenerCmd::Disconnect(_session_id, snapshot) => {
            assert_eq!(snapshot.inflight.len(), 1);
            assert_eq!(snapshot.inflight[0].packet.topic(), "q/1");
        }
        cmd => panic!("expected disconnect cmd, got {cmd:?}"),
    }
}
