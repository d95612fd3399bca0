// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::interval;

use crate::commands::{DispatcherToListenerCmd, DispatcherToMetricsCmd, ListenerToDispatcherCmd};
use crate::config;
use crate::store::{new_backend, StoreBackend};
use crate::types::{ListenerId, SessionGid};

mod listener;
mod retain;
mod sessions;
mod trie;

pub use retain::{RetainChange, RetainedStore};
pub use sessions::{ConnectResolution, ResumedSession, SessionRecord, SessionStore};
pub use trie::SubTrie;

/// Cadence of the expiry sweep over disconnected persistent sessions.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Dispatcher is the message router.
///
/// It owns the broker wide state: the subscription trie, the retained message
/// store and the session records. Listeners hand it decoded packets; it hands
/// back deliveries addressed to specific sessions. Single ownership keeps all
/// index mutations on one task, so ordering follows from channel FIFO without
/// further locking.
pub struct Dispatcher {
    sub_trie: SubTrie,
    retained: RetainedStore,
    sessions: SessionStore,

    /// Live connections, gid to client id.
    clients: HashMap<SessionGid, String>,

    store: Box<dyn StoreBackend>,
    persistence: bool,
    session_expiry: Duration,

    listener_senders: HashMap<ListenerId, Sender<DispatcherToListenerCmd>>,
    listener_receiver: Receiver<ListenerToDispatcherCmd>,

    metrics_sender: Sender<DispatcherToMetricsCmd>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        storage_config: &config::Storage,
        listener_senders: Vec<(ListenerId, Sender<DispatcherToListenerCmd>)>,
        listener_receiver: Receiver<ListenerToDispatcherCmd>,
        metrics_sender: Sender<DispatcherToMetricsCmd>,
    ) -> Self {
        Self {
            sub_trie: SubTrie::new(),
            retained: RetainedStore::new(storage_config.retained_message_limit()),
            sessions: SessionStore::new(storage_config.message_queue_limit()),

            clients: HashMap::new(),

            store: new_backend(storage_config),
            persistence: storage_config.persistence(),
            session_expiry: storage_config.session_expiry(),

            listener_senders: listener_senders.into_iter().collect(),
            listener_receiver,

            metrics_sender,
        }
    }

    pub async fn run_loop(&mut self) -> ! {
        let mut sweep = interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                Some(cmd) = self.listener_receiver.recv() => {
                    if let Err(err) = self.handle_listener_cmd(cmd).await {
                        log::error!("dispatcher: handle listener cmd failed: {err:?}");
                    }
                },
                _ = sweep.tick() => {
                    self.sweep_expired_sessions().await;
                }
            }
        }
    }

    async fn sweep_expired_sessions(&mut self) {
        let expired = self.sessions.sweep_expired(self.session_expiry);
        for (client_id, _filters) in &expired {
            log::info!("dispatcher: expired session {client_id}");
            let removed = self.sub_trie.unsubscribe_client(client_id);
            self.send_metrics(DispatcherToMetricsCmd::SubscriptionsRemoved(removed))
                .await;
            if self.persistence {
                if let Err(err) = self.store.delete_session(client_id) {
                    log::error!("store: delete_session failed: {err}");
                }
            }
        }

        if self.persistence {
            if let Err(err) = self.store.purge_expired() {
                log::error!("store: purge_expired failed: {err}");
            }
        }
    }

    pub(super) async fn send_metrics(&mut self, cmd: DispatcherToMetricsCmd) {
        if let Err(err) = self.metrics_sender.send(cmd).await {
            log::error!("dispatcher: Failed to send metrics cmd: {err:?}");
        }
    }

    pub(super) async fn send_to_listener(&mut self, gid: SessionGid, cmd: DispatcherToListenerCmd) {
        if let Some(listener_sender) = self.listener_senders.get(&gid.listener_id()) {
            if let Err(err) = listener_sender.send(cmd).await {
                log::error!(
                    "dispatcher: Failed to send cmd to listener {}, err: {:?}",
                    gid.listener_id(),
                    err
                );
            }
        } else {
            log::error!(
                "dispatcher: Failed to get listener sender with id: {}",
                gid.listener_id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use codec::{PacketId, PublishPacket, QoS, SubscribeAck, SubscribePacket};
    use tokio::sync::mpsc;

    use super::*;
    use crate::commands::SessionSnapshot;
    use crate::types::LastWill;

    fn new_dispatcher() -> (Dispatcher, mpsc::Receiver<DispatcherToListenerCmd>) {
        let storage = crate::config::Storage::default();
        let (listener_sender, listener_receiver) = mpsc::channel(64);
        let (_cmd_sender, cmd_receiver) = mpsc::channel(64);
        // Counter sends fail silently once the receiver is dropped, which is
        // fine here, counters are not asserted.
        let (metrics_sender, _metrics_receiver) = mpsc::channel(1024);
        let dispatcher = Dispatcher::new(
            &storage,
            vec![(0, listener_sender)],
            cmd_receiver,
            metrics_sender,
        );
        (dispatcher, listener_receiver)
    }

    async fn connect(
        dispatcher: &mut Dispatcher,
        session_id: u64,
        client_id: &str,
        clean_session: bool,
        will: Option<LastWill>,
    ) {
        dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::SessionConnected {
                gid: SessionGid::new(0, session_id),
                client_id: client_id.to_string(),
                clean_session,
                will,
            })
            .await
            .unwrap();
    }

    async fn subscribe(dispatcher: &mut Dispatcher, session_id: u64, filter: &str, qos: QoS) {
        let packet = SubscribePacket::new(filter, qos, PacketId::new(1)).unwrap();
        dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::Subscribe(
                SessionGid::new(0, session_id),
                packet,
            ))
            .await
            .unwrap();
    }

    async fn publish(dispatcher: &mut Dispatcher, session_id: u64, packet: PublishPacket) {
        dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::Publish(
                SessionGid::new(0, session_id),
                packet,
            ))
            .await
            .unwrap();
    }

    async fn close(dispatcher: &mut Dispatcher, session_id: u64, graceful: bool) {
        dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::SessionClosed(
                SessionGid::new(0, session_id),
                SessionSnapshot {
                    graceful,
                    inflight: Vec::new(),
                },
            ))
            .await
            .unwrap();
    }

    fn expect_connect_ack(
        receiver: &mut mpsc::Receiver<DispatcherToListenerCmd>,
        session_id: u64,
    ) -> bool {
        match receiver.try_recv().expect("expected connect ack") {
            DispatcherToListenerCmd::ConnectAck(id, ack, _inflight) => {
                assert_eq!(id, session_id);
                ack.session_present()
            }
            cmd => panic!("expected connect ack, got {cmd:?}"),
        }
    }

    fn expect_publish(
        receiver: &mut mpsc::Receiver<DispatcherToListenerCmd>,
        session_id: u64,
    ) -> PublishPacket {
        match receiver.try_recv().expect("expected publish") {
            DispatcherToListenerCmd::Publish(id, packet) => {
                assert_eq!(id, session_id);
                packet
            }
            cmd => panic!("expected publish, got {cmd:?}"),
        }
    }

    fn expect_subscribe_ack(
        receiver: &mut mpsc::Receiver<DispatcherToListenerCmd>,
        session_id: u64,
    ) -> Vec<SubscribeAck> {
        match receiver.try_recv().expect("expected subscribe ack") {
            DispatcherToListenerCmd::SubscribeAck(id, packet) => {
                assert_eq!(id, session_id);
                packet.acknowledgements().to_vec()
            }
            cmd => panic!("expected subscribe ack, got {cmd:?}"),
        }
    }

    #[tokio::test]
    async fn test_qos0_fan_out() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "sub", true, None).await;
        assert!(!expect_connect_ack(&mut receiver, 1));
        subscribe(&mut dispatcher, 1, "sensors/+/temp", QoS::AtMostOnce).await;
        assert_eq!(
            expect_subscribe_ack(&mut receiver, 1),
            vec![SubscribeAck::QoS(QoS::AtMostOnce)]
        );

        connect(&mut dispatcher, 2, "pub", true, None).await;
        assert!(!expect_connect_ack(&mut receiver, 2));
        let packet =
            PublishPacket::new("sensors/a/temp", QoS::AtMostOnce, &[0x32, 0x35]).unwrap();
        publish(&mut dispatcher, 2, packet).await;

        let delivered = expect_publish(&mut receiver, 1);
        assert_eq!(delivered.topic(), "sensors/a/temp");
        assert_eq!(delivered.message(), &[0x32, 0x35]);
        assert_eq!(delivered.qos(), QoS::AtMostOnce);
        assert!(!delivered.retain());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_qos_downgrade_per_subscriber() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "low", true, None).await;
        expect_connect_ack(&mut receiver, 1);
        subscribe(&mut dispatcher, 1, "a/b", QoS::AtMostOnce).await;
        expect_subscribe_ack(&mut receiver, 1);

        connect(&mut dispatcher, 2, "high", true, None).await;
        expect_connect_ack(&mut receiver, 2);
        subscribe(&mut dispatcher, 2, "a/b", QoS::ExactOnce).await;
        expect_subscribe_ack(&mut receiver, 2);

        connect(&mut dispatcher, 3, "pub", true, None).await;
        expect_connect_ack(&mut receiver, 3);
        let mut packet = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
        packet.set_packet_id(PacketId::new(7));
        publish(&mut dispatcher, 3, packet).await;

        let mut deliveries = vec![
            expect_publish(&mut receiver, 1),
            expect_publish(&mut receiver, 2),
        ];
        // Fan-out order across subscribers is not guaranteed.
        deliveries.sort_by_key(PublishPacket::qos);
        assert_eq!(deliveries[0].qos(), QoS::AtMostOnce);
        assert_eq!(deliveries[1].qos(), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_retained_delivered_to_late_subscriber() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "pub", true, None).await;
        expect_connect_ack(&mut receiver, 1);
        let mut packet = PublishPacket::new("status/x", QoS::AtMostOnce, &[0x4f, 0x4b]).unwrap();
        packet.set_retain(true);
        publish(&mut dispatcher, 1, packet).await;

        connect(&mut dispatcher, 2, "sub", true, None).await;
        expect_connect_ack(&mut receiver, 2);
        subscribe(&mut dispatcher, 2, "status/+", QoS::AtMostOnce).await;

        // SubscribeAck first, then the retained message with retain flag set.
        expect_subscribe_ack(&mut receiver, 2);
        let delivered = expect_publish(&mut receiver, 2);
        assert_eq!(delivered.topic(), "status/x");
        assert_eq!(delivered.message(), &[0x4f, 0x4b]);
        assert!(delivered.retain());
    }

    #[tokio::test]
    async fn test_empty_payload_deletes_retained() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "pub", true, None).await;
        expect_connect_ack(&mut receiver, 1);
        let mut packet = PublishPacket::new("status/x", QoS::AtMostOnce, &[0x4f]).unwrap();
        packet.set_retain(true);
        publish(&mut dispatcher, 1, packet).await;

        let mut packet = PublishPacket::new("status/x", QoS::AtMostOnce, &[]).unwrap();
        packet.set_retain(true);
        publish(&mut dispatcher, 1, packet).await;

        connect(&mut dispatcher, 2, "sub", true, None).await;
        expect_connect_ack(&mut receiver, 2);
        subscribe(&mut dispatcher, 2, "status/+", QoS::AtMostOnce).await;
        expect_subscribe_ack(&mut receiver, 2);
        // No retained message follows the ack.
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_will_published_on_abrupt_close_only() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "sub", true, None).await;
        expect_connect_ack(&mut receiver, 1);
        subscribe(&mut dispatcher, 1, "dev/+/lwt", QoS::AtMostOnce).await;
        expect_subscribe_ack(&mut receiver, 1);

        let will = LastWill {
            topic: "dev/pub/lwt".to_string(),
            message: vec![0x62, 0x79, 0x65],
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        // Graceful disconnect suppresses the will.
        connect(&mut dispatcher, 2, "pub", true, Some(will.clone())).await;
        expect_connect_ack(&mut receiver, 2);
        close(&mut dispatcher, 2, true).await;
        assert!(receiver.try_recv().is_err());

        // Abrupt close publishes it through normal routing.
        connect(&mut dispatcher, 3, "pub", true, Some(will)).await;
        expect_connect_ack(&mut receiver, 3);
        close(&mut dispatcher, 3, false).await;

        let delivered = expect_publish(&mut receiver, 1);
        assert_eq!(delivered.topic(), "dev/pub/lwt");
        assert_eq!(delivered.message(), &[0x62, 0x79, 0x65]);
        assert_eq!(delivered.qos(), QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_persistent_session_queues_and_resumes() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "s1", false, None).await;
        assert!(!expect_connect_ack(&mut receiver, 1));
        subscribe(&mut dispatcher, 1, "q/#", QoS::AtLeastOnce).await;
        expect_subscribe_ack(&mut receiver, 1);
        close(&mut dispatcher, 1, true).await;

        connect(&mut dispatcher, 2, "pub", true, None).await;
        expect_connect_ack(&mut receiver, 2);
        for n in 1_u8..=3 {
            let mut packet =
                PublishPacket::new(&format!("q/{n}"), QoS::AtLeastOnce, &[n]).unwrap();
            packet.set_packet_id(PacketId::new(u16::from(n)));
            publish(&mut dispatcher, 2, packet).await;
        }
        assert!(receiver.try_recv().is_err());

        // Reconnect within the expiry window: session present, queued
        // messages arrive in publication order before anything else.
        connect(&mut dispatcher, 3, "s1", false, None).await;
        assert!(expect_connect_ack(&mut receiver, 3));
        for n in 1_u8..=3 {
            let delivered = expect_publish(&mut receiver, 3);
            assert_eq!(delivered.topic(), format!("q/{n}"));
            assert_eq!(delivered.qos(), QoS::AtLeastOnce);
        }
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clean_session_drops_offline_state() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "c1", true, None).await;
        expect_connect_ack(&mut receiver, 1);
        subscribe(&mut dispatcher, 1, "q/#", QoS::AtLeastOnce).await;
        expect_subscribe_ack(&mut receiver, 1);
        close(&mut dispatcher, 1, true).await;

        connect(&mut dispatcher, 2, "pub", true, None).await;
        expect_connect_ack(&mut receiver, 2);
        let packet = PublishPacket::new("q/1", QoS::AtLeastOnce, &[0x01]).unwrap();
        publish(&mut dispatcher, 2, packet).await;

        // Reconnect: no session state, nothing queued.
        connect(&mut dispatcher, 3, "c1", true, None).await;
        assert!(!expect_connect_ack(&mut receiver, 3));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_client_id_takeover() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "dup", true, None).await;
        expect_connect_ack(&mut receiver, 1);

        connect(&mut dispatcher, 2, "dup", true, None).await;
        // The existing connection is told to go away before the new one is
        // acknowledged.
        match receiver.try_recv().expect("expected disconnect") {
            DispatcherToListenerCmd::Disconnect(session_id) => assert_eq!(session_id, 1),
            cmd => panic!("expected disconnect, got {cmd:?}"),
        }
        expect_connect_ack(&mut receiver, 2);

        // The stale close of the first connection must not destroy the new
        // session.
        close(&mut dispatcher, 1, true).await;
        subscribe(&mut dispatcher, 2, "a/b", QoS::AtMostOnce).await;
        assert_eq!(
            expect_subscribe_ack(&mut receiver, 2),
            vec![SubscribeAck::QoS(QoS::AtMostOnce)]
        );
    }

    #[tokio::test]
    async fn test_invalid_filter_gets_failure_code() {
        let (mut dispatcher, mut receiver) = new_dispatcher();

        connect(&mut dispatcher, 1, "sub", true, None).await;
        expect_connect_ack(&mut receiver, 1);

        // The filter "a/#/b" is decoded from crafted bytes; the packet
        // constructor refuses to build it.
        use codec::{ByteArray, DecodePacket};
        let crafted: Vec<u8> = vec![
            0x82, 0x0a, 0x00, 0x01, 0x00, 0x05, b'a', b'/', b'#', b'/', b'b', 0x00,
        ];
        let mut ba = ByteArray::new(&crafted);
        let packet = SubscribePacket::decode(&mut ba).unwrap();

        dispatcher
            .handle_listener_cmd(ListenerToDispatcherCmd::Subscribe(
                SessionGid::new(0, 1),
                packet,
            ))
            .await
            .unwrap();
        assert_eq!(
            expect_subscribe_ack(&mut receiver, 1),
            vec![SubscribeAck::Failed]
        );
    }
}

