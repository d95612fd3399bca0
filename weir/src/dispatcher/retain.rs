// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Retained message store.

use codec::{PublishPacket, TopicFilter};
use std::collections::HashMap;

/// Result of applying a retained publish to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainChange {
    /// New entry stored, payload byte count.
    Stored(usize),

    /// Prior entry replaced, old and new payload byte counts.
    Replaced(usize, usize),

    /// Empty payload removed the prior entry, old payload byte count.
    Removed(usize),

    /// Empty payload with no prior entry, or the store is full.
    None,
}

/// Maps exact topic to the most recent message published with the retain flag
/// set.
///
/// At most one entry exists per topic, and an entry with empty payload never
/// exists: an empty-payload retained publish deletes the entry.
#[derive(Debug, Default, Clone)]
pub struct RetainedStore {
    entries: HashMap<String, PublishPacket>,

    /// Maximum number of entries, 0 means unlimited.
    limit: usize,
}

impl RetainedStore {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a retained publish.
    ///
    /// A retained publish with empty payload deletes the entry and is never
    /// stored itself.
    pub fn insert(&mut self, packet: &PublishPacket) -> RetainChange {
        if packet.message().is_empty() {
            return match self.entries.remove(packet.topic()) {
                Some(old) => RetainChange::Removed(old.message().len()),
                None => RetainChange::None,
            };
        }

        let mut stored = packet.clone();
        // The entry keeps payload and qos; delivery state of the original
        // transmission does not.
        stored.set_retain(true);
        stored.set_packet_id(codec::PacketId::new(0));
        let _ret = stored.set_dup(false);

        if let Some(old) = self.entries.get(packet.topic()) {
            let old_len = old.message().len();
            let new_len = stored.message().len();
            self.entries.insert(packet.topic().to_string(), stored);
            return RetainChange::Replaced(old_len, new_len);
        }

        if self.limit > 0 && self.entries.len() >= self.limit {
            log::warn!(
                "retain: Store is full ({} entries), dropping retained publish to {}",
                self.entries.len(),
                packet.topic()
            );
            return RetainChange::None;
        }

        let len = stored.message().len();
        self.entries.insert(packet.topic().to_string(), stored);
        RetainChange::Stored(len)
    }

    /// Remove the entry of `topic`.
    pub fn remove(&mut self, topic: &str) -> Option<PublishPacket> {
        self.entries.remove(topic)
    }

    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&PublishPacket> {
        self.entries.get(topic)
    }

    /// Enumerate entries whose topic matches `filter`, for delivery to a new
    /// subscription. Delivered copies carry `retain=true` on the wire.
    #[must_use]
    pub fn matches(&self, filter: &TopicFilter) -> Vec<PublishPacket> {
        self.entries
            .iter()
            .filter(|(topic, _packet)| filter.is_match(topic))
            .map(|(_topic, packet)| packet.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::QoS;

    fn retained(topic: &str, payload: &[u8]) -> PublishPacket {
        let mut packet = PublishPacket::new(topic, QoS::AtMostOnce, payload).unwrap();
        packet.set_retain(true);
        packet
    }

    #[test]
    fn test_put_then_get() {
        let mut store = RetainedStore::new(0);
        let packet = retained("status/x", &[0x4f, 0x4b]);
        assert_eq!(store.insert(&packet), RetainChange::Stored(2));

        let entry = store.get("status/x").unwrap();
        assert_eq!(entry.message(), &[0x4f, 0x4b]);
        assert!(entry.retain());
    }

    #[test]
    fn test_replace() {
        let mut store = RetainedStore::new(0);
        store.insert(&retained("status/x", &[0x01]));
        assert_eq!(
            store.insert(&retained("status/x", &[0x02, 0x03])),
            RetainChange::Replaced(1, 2)
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("status/x").unwrap().message(), &[0x02, 0x03]);
    }

    #[test]
    fn test_empty_payload_deletes() {
        let mut store = RetainedStore::new(0);
        store.insert(&retained("status/x", &[0x4f, 0x4b]));
        assert_eq!(
            store.insert(&retained("status/x", &[])),
            RetainChange::Removed(2)
        );
        assert!(store.get("status/x").is_none());
        assert!(store.is_empty());

        // Deleting an absent entry never stores anything.
        assert_eq!(store.insert(&retained("status/y", &[])), RetainChange::None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_matches_filter() {
        let mut store = RetainedStore::new(0);
        store.insert(&retained("status/x", &[0x01]));
        store.insert(&retained("status/y", &[0x02]));
        store.insert(&retained("other", &[0x03]));

        let filter = TopicFilter::parse("status/+").unwrap();
        let mut matched = store.matches(&filter);
        matched.sort_by(|a, b| a.topic().cmp(b.topic()));
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].topic(), "status/x");
        assert_eq!(matched[1].topic(), "status/y");
        assert!(matched.iter().all(PublishPacket::retain));
    }

    #[test]
    fn test_limit() {
        let mut store = RetainedStore::new(1);
        assert_eq!(
            store.insert(&retained("a", &[0x01])),
            RetainChange::Stored(1)
        );
        // Full store drops new topics but still replaces existing ones.
        assert_eq!(store.insert(&retained("b", &[0x02])), RetainChange::None);
        assert_eq!(
            store.insert(&retained("a", &[0x03])),
            RetainChange::Replaced(1, 1)
        );
    }
}
