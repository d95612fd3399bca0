// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{PublishPacket, TopicFilter};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{StoreBackend, StoreStats, StoredSession};
use crate::error::Error;

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Builtin in-memory store backend.
///
/// Three logical collections: sessions keyed by client id with a TTL,
/// retained keyed by topic, and an optional message log for replay.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: HashMap<String, Expiring<StoredSession>>,
    retained: HashMap<String, PublishPacket>,
    messages: Vec<Expiring<PublishPacket>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryStore {
    fn get_session(&mut self, client_id: &str) -> Result<Option<StoredSession>, Error> {
        let now = Instant::now();
        match self.sessions.get(client_id) {
            Some(entry) if entry.is_expired(now) => {
                self.sessions.remove(client_id);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn put_session(&mut self, session: StoredSession, ttl: Option<Duration>) -> Result<(), Error> {
        self.sessions
            .insert(session.client_id.clone(), Expiring::new(session, ttl));
        Ok(())
    }

    fn delete_session(&mut self, client_id: &str) -> Result<(), Error> {
        self.sessions.remove(client_id);
        Ok(())
    }

    fn get_retained(&mut self, topic: &str) -> Result<Option<PublishPacket>, Error> {
        Ok(self.retained.get(topic).cloned())
    }

    fn put_retained(&mut self, packet: PublishPacket) -> Result<(), Error> {
        self.retained.insert(packet.topic().to_string(), packet);
        Ok(())
    }

    fn delete_retained(&mut self, topic: &str) -> Result<(), Error> {
        self.retained.remove(topic);
        Ok(())
    }

    fn match_retained(&mut self, filter: &TopicFilter) -> Result<Vec<PublishPacket>, Error> {
        Ok(self
            .retained
            .iter()
            .filter(|(topic, _packet)| filter.is_match(topic))
            .map(|(_topic, packet)| packet.clone())
            .collect())
    }

    fn put_message(&mut self, packet: PublishPacket, ttl: Option<Duration>) -> Result<(), Error> {
        self.messages.push(Expiring::new(packet, ttl));
        Ok(())
    }

    fn stats(&mut self) -> Result<StoreStats, Error> {
        Ok(StoreStats {
            sessions: self.sessions.len(),
            retained: self.retained.len(),
            messages: self.messages.len(),
        })
    }

    fn purge_expired(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        self.sessions.retain(|_client_id, entry| !entry.is_expired(now));
        self.messages.retain(|entry| !entry.is_expired(now));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::QoS;

    #[test]
    fn test_session_round_trip() {
        let mut store = MemoryStore::new();
        let session = StoredSession {
            client_id: "s1".to_string(),
            subscriptions: vec![("q/#".to_string(), QoS::AtLeastOnce)],
            queued: Vec::new(),
        };
        store.put_session(session, None).unwrap();

        let got = store.get_session("s1").unwrap().unwrap();
        assert_eq!(got.client_id, "s1");
        assert_eq!(got.subscriptions.len(), 1);

        store.delete_session("s1").unwrap();
        assert!(store.get_session("s1").unwrap().is_none());
    }

    #[test]
    fn test_session_ttl() {
        let mut store = MemoryStore::new();
        let session = StoredSession {
            client_id: "s1".to_string(),
            ..StoredSession::default()
        };
        store
            .put_session(session, Some(Duration::from_secs(0)))
            .unwrap();
        assert!(store.get_session("s1").unwrap().is_none());
    }

    #[test]
    fn test_match_retained() {
        let mut store = MemoryStore::new();
        let packet = PublishPacket::new("status/x", QoS::AtMostOnce, &[0x4f, 0x4b]).unwrap();
        store.put_retained(packet).unwrap();

        let filter = TopicFilter::parse("status/+").unwrap();
        let matched = store.match_retained(&filter).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].topic(), "status/x");

        store.delete_retained("status/x").unwrap();
        assert!(store.match_retained(&filter).unwrap().is_empty());
    }
}
