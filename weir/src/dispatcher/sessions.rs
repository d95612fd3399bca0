// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Session records, owning all per-client state which must survive the
//! connection when clean session is unset.

use codec::{PublishPacket, QoS};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::session::InflightDelivery;
use crate::store::StoredSession;
use crate::types::{LastWill, SessionGid};

/// Per-client session state.
#[derive(Debug)]
pub struct SessionRecord {
    client_id: String,
    clean_session: bool,
    connected: bool,

    /// Live connection, when connected.
    gid: Option<SessionGid>,

    /// Topic filter to granted qos.
    subscriptions: HashMap<String, QoS>,

    /// Messages queued while the persistent session was disconnected,
    /// oldest first.
    queued: VecDeque<PublishPacket>,

    /// Unacknowledged outbound deliveries stashed at disconnect.
    inflight: Vec<InflightDelivery>,

    will: Option<LastWill>,

    created_at: Instant,
    last_activity: Instant,
}

impl SessionRecord {
    fn new(client_id: &str, clean_session: bool, gid: SessionGid, will: Option<LastWill>) -> Self {
        let now = Instant::now();
        Self {
            client_id: client_id.to_string(),
            clean_session,
            connected: true,
            gid: Some(gid),
            subscriptions: HashMap::new(),
            queued: VecDeque::new(),
            inflight: Vec::new(),
            will,
            created_at: now,
            last_activity: now,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub const fn gid(&self) -> Option<SessionGid> {
        self.gid
    }

    #[must_use]
    pub const fn subscriptions(&self) -> &HashMap<String, QoS> {
        &self.subscriptions
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}

/// State carried over when a connect request resumes an existing session.
#[derive(Debug, Default)]
pub struct ResumedSession {
    /// Filter to granted qos, for retained message delivery.
    pub subscriptions: Vec<(String, QoS)>,

    /// Drained offline queue, oldest first.
    pub queued: Vec<PublishPacket>,

    /// Stashed inflight deliveries to retransmit.
    pub inflight: Vec<InflightDelivery>,
}

/// Outcome of resolving a connect request against the stored sessions.
#[derive(Debug)]
pub struct ConnectResolution {
    /// True only if a persistent session with this client id pre-existed.
    pub session_present: bool,

    pub resumed: ResumedSession,
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, SessionRecord>,

    /// Per-session offline queue cap, 0 means unlimited.
    queue_limit: usize,
}

impl SessionStore {
    #[must_use]
    pub fn new(queue_limit: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            queue_limit,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<&SessionRecord> {
        self.sessions.get(client_id)
    }

    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Resolve a connect request.
    ///
    /// With `clean_session` set, any prior session for that client id is
    /// destroyed and a fresh one is built. Otherwise the existing in-memory
    /// session is resumed; when absent, `stored` (reconstructed from the
    /// persistent store collaborator) seeds the new record; else a fresh
    /// record is created. `session_present` is true only when a prior session
    /// actually existed.
    pub fn create_or_reuse(
        &mut self,
        client_id: &str,
        clean_session: bool,
        gid: SessionGid,
        will: Option<LastWill>,
        stored: Option<StoredSession>,
    ) -> ConnectResolution {
        if clean_session {
            self.sessions.remove(client_id);
            self.sessions.insert(
                client_id.to_string(),
                SessionRecord::new(client_id, true, gid, will),
            );
            return ConnectResolution {
                session_present: false,
                resumed: ResumedSession::default(),
            };
        }

        if let Some(record) = self.sessions.get_mut(client_id) {
            record.connected = true;
            record.gid = Some(gid);
            record.will = will;
            record.clean_session = false;
            record.last_activity = Instant::now();

            let resumed = ResumedSession {
                subscriptions: record
                    .subscriptions
                    .iter()
                    .map(|(filter, qos)| (filter.clone(), *qos))
                    .collect(),
                queued: record.queued.drain(..).collect(),
                inflight: std::mem::take(&mut record.inflight),
            };
            return ConnectResolution {
                session_present: true,
                resumed,
            };
        }

        let mut record = SessionRecord::new(client_id, false, gid, will);
        if let Some(stored) = stored {
            record.subscriptions = stored.subscriptions.into_iter().collect();
            record.queued = stored.queued.into();
            let resumed = ResumedSession {
                subscriptions: record
                    .subscriptions
                    .iter()
                    .map(|(filter, qos)| (filter.clone(), *qos))
                    .collect(),
                queued: record.queued.drain(..).collect(),
                inflight: Vec::new(),
            };
            self.sessions.insert(client_id.to_string(), record);
            return ConnectResolution {
                session_present: true,
                resumed,
            };
        }

        self.sessions.insert(client_id.to_string(), record);
        ConnectResolution {
            session_present: false,
            resumed: ResumedSession::default(),
        }
    }

    /// Mark the session of `client_id` as disconnected, stashing unfinished
    /// deliveries for retransmission on reconnect.
    ///
    /// Clean sessions are destroyed instead. Returns the will message to
    /// publish (on abrupt close) and the filter set to purge from the topic
    /// index when the session was destroyed.
    pub fn disconnect(
        &mut self,
        client_id: &str,
        inflight: Vec<InflightDelivery>,
    ) -> (Option<LastWill>, Option<Vec<String>>) {
        let Some(record) = self.sessions.get_mut(client_id) else {
            return (None, None);
        };

        let will = record.will.take();

        if record.clean_session {
            let record = self.sessions.remove(client_id);
            let filters =
                record.map(|record| record.subscriptions.keys().cloned().collect::<Vec<_>>());
            return (will, filters);
        }

        record.connected = false;
        record.gid = None;
        record.inflight = inflight;
        record.last_activity = Instant::now();
        (will, None)
    }

    /// Destroy the session of `client_id`, returning its filter set.
    pub fn remove(&mut self, client_id: &str) -> Option<Vec<String>> {
        self.sessions
            .remove(client_id)
            .map(|record| record.subscriptions.keys().cloned().collect())
    }

    /// Mirror a granted subscription. Must be invoked in lockstep with the
    /// topic index.
    pub fn add_subscription(&mut self, client_id: &str, filter: &str, qos: QoS) {
        if let Some(record) = self.sessions.get_mut(client_id) {
            record.subscriptions.insert(filter.to_string(), qos);
            record.last_activity = Instant::now();
        }
    }

    /// Remove a subscription mirror. Must be invoked in lockstep with the
    /// topic index.
    pub fn remove_subscription(&mut self, client_id: &str, filter: &str) {
        if let Some(record) = self.sessions.get_mut(client_id) {
            record.subscriptions.remove(filter);
            record.last_activity = Instant::now();
        }
    }

    /// Append a message to the offline queue of a disconnected persistent
    /// session. On overflow the oldest message is dropped.
    ///
    /// Returns false when the message was not queued (clean or unknown
    /// session), and the number of dropped messages.
    pub fn enqueue(&mut self, client_id: &str, packet: PublishPacket) -> (bool, usize) {
        let Some(record) = self.sessions.get_mut(client_id) else {
            return (false, 0);
        };
        if record.clean_session || record.connected {
            return (false, 0);
        }

        let mut dropped = 0;
        if self.queue_limit > 0 {
            while record.queued.len() >= self.queue_limit {
                record.queued.pop_front();
                dropped += 1;
            }
        }
        record.queued.push_back(packet);
        (true, dropped)
    }

    /// Atomically return and empty the offline queue.
    pub fn drain_queue(&mut self, client_id: &str) -> Vec<PublishPacket> {
        self.sessions
            .get_mut(client_id)
            .map(|record| record.queued.drain(..).collect())
            .unwrap_or_default()
    }

    /// Remove disconnected, non-clean sessions whose last activity is older
    /// than `expiry`. Returns (client id, filter set) pairs of the removed
    /// sessions for topic index cleanup.
    pub fn sweep_expired(&mut self, expiry: Duration) -> Vec<(String, Vec<String>)> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|record| {
                !record.connected
                    && !record.clean_session
                    && now.duration_since(record.last_activity) > expiry
            })
            .map(|record| record.client_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|client_id| {
                self.remove(&client_id).map(|filters| (client_id, filters))
            })
            .collect()
    }

    /// Serializable view of a session, for the persistent store collaborator.
    #[must_use]
    pub fn stored_view(&self, client_id: &str) -> Option<StoredSession> {
        self.sessions.get(client_id).map(|record| StoredSession {
            client_id: record.client_id.clone(),
            subscriptions: record
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter.clone(), *qos))
                .collect(),
            queued: record.queued.iter().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::QoS;

    fn gid(n: u64) -> SessionGid {
        SessionGid::new(0, n)
    }

    fn publish(topic: &str, payload: &[u8]) -> PublishPacket {
        PublishPacket::new(topic, QoS::AtLeastOnce, payload).unwrap()
    }

    #[test]
    fn test_clean_session_destroys_prior_state() {
        let mut store = SessionStore::new(16);
        store.create_or_reuse("s1", false, gid(1), None, None);
        store.add_subscription("s1", "q/#", QoS::AtLeastOnce);
        store.disconnect("s1", Vec::new());
        store.enqueue("s1", publish("q/1", &[0x01]));

        let resolution = store.create_or_reuse("s1", true, gid(2), None, None);
        assert!(!resolution.session_present);
        assert!(resolution.resumed.subscriptions.is_empty());
        assert!(resolution.resumed.queued.is_empty());
    }

    #[test]
    fn test_persistent_session_resumes() {
        let mut store = SessionStore::new(16);
        store.create_or_reuse("s1", false, gid(1), None, None);
        store.add_subscription("s1", "q/#", QoS::AtLeastOnce);
        store.disconnect("s1", Vec::new());

        for n in 1..=3 {
            let (queued, dropped) = store.enqueue("s1", publish(&format!("q/{n}"), &[n]));
            assert!(queued);
            assert_eq!(dropped, 0);
        }

        let resolution = store.create_or_reuse("s1", false, gid(2), None, None);
        assert!(resolution.session_present);
        assert_eq!(
            resolution.resumed.subscriptions,
            vec![("q/#".to_string(), QoS::AtLeastOnce)]
        );
        // Queued messages come back in publication order.
        let topics: Vec<&str> = resolution
            .resumed
            .queued
            .iter()
            .map(PublishPacket::topic)
            .collect();
        assert_eq!(topics, ["q/1", "q/2", "q/3"]);
        assert_eq!(store.get("s1").unwrap().queued_len(), 0);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let mut store = SessionStore::new(2);
        store.create_or_reuse("s1", false, gid(1), None, None);
        store.disconnect("s1", Vec::new());

        assert_eq!(store.enqueue("s1", publish("q/1", &[1])), (true, 0));
        assert_eq!(store.enqueue("s1", publish("q/2", &[2])), (true, 0));
        assert_eq!(store.enqueue("s1", publish("q/3", &[3])), (true, 1));

        let queued = store.drain_queue("s1");
        let topics: Vec<&str> = queued.iter().map(PublishPacket::topic).collect();
        assert_eq!(topics, ["q/2", "q/3"]);
    }

    #[test]
    fn test_connected_session_does_not_queue() {
        let mut store = SessionStore::new(2);
        store.create_or_reuse("s1", false, gid(1), None, None);
        assert_eq!(store.enqueue("s1", publish("q/1", &[1])), (false, 0));
    }

    #[test]
    fn test_disconnect_returns_will_once() {
        let will = LastWill {
            topic: "dev/pub/lwt".to_string(),
            message: vec![0x62, 0x79, 0x65],
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        let mut store = SessionStore::new(16);
        store.create_or_reuse("pub", false, gid(1), Some(will.clone()), None);

        let (got_will, filters) = store.disconnect("pub", Vec::new());
        assert_eq!(got_will, Some(will));
        assert!(filters.is_none());

        // The record survives but the will is consumed.
        let (got_will, _filters) = store.disconnect("pub", Vec::new());
        assert!(got_will.is_none());
    }

    #[test]
    fn test_clean_disconnect_destroys() {
        let mut store = SessionStore::new(16);
        store.create_or_reuse("c1", true, gid(1), None, None);
        store.add_subscription("c1", "a/b", QoS::AtMostOnce);

        let (_will, filters) = store.disconnect("c1", Vec::new());
        assert_eq!(filters, Some(vec!["a/b".to_string()]));
        assert!(!store.contains("c1"));
    }

    #[test]
    fn test_sweep_expired() {
        let mut store = SessionStore::new(16);
        store.create_or_reuse("s1", false, gid(1), None, None);
        store.add_subscription("s1", "q/#", QoS::AtLeastOnce);
        store.disconnect("s1", Vec::new());

        // Still connected sessions are never swept.
        store.create_or_reuse("s2", false, gid(2), None, None);

        let removed = store.sweep_expired(Duration::from_secs(0));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "s1");
        assert_eq!(removed[0].1, vec!["q/#".to_string()]);
        assert!(store.contains("s2"));
    }

    #[test]
    fn test_reconstructed_from_store_is_present() {
        let stored = StoredSession {
            client_id: "s1".to_string(),
            subscriptions: vec![("q/#".to_string(), QoS::AtLeastOnce)],
            queued: vec![publish("q/1", &[1])],
        };
        let mut store = SessionStore::new(16);
        let resolution = store.create_or_reuse("s1", false, gid(1), None, Some(stored));
        assert!(resolution.session_present);
        assert_eq!(resolution.resumed.queued.len(), 1);
        assert_eq!(resolution.resumed.subscriptions.len(), 1);
    }
}
