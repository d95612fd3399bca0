// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Pluggable persistent store collaborator.
//!
//! The broker mirrors session and retained message state into a narrow
//! key/value backend so persistent sessions survive a restart. On any backend
//! failure the broker keeps operating with in-memory state; errors are logged
//! and never surface to clients.

use codec::{PublishPacket, QoS, TopicFilter};
use std::time::Duration;

use crate::config::{Storage, StorageType};
use crate::error::Error;

mod memory;

pub use memory::MemoryStore;

/// Serializable view of a persistent session.
#[derive(Debug, Clone, Default)]
pub struct StoredSession {
    pub client_id: String,

    /// Topic filter to granted qos.
    pub subscriptions: Vec<(String, QoS)>,

    /// Offline queue, oldest first.
    pub queued: Vec<PublishPacket>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub sessions: usize,
    pub retained: usize,
    pub messages: usize,
}

/// Narrow interface of the persistent key/value backend.
///
/// TTLs are enforced by the store itself.
pub trait StoreBackend: Send {
    /// # Errors
    /// Returns error on backend failure.
    fn get_session(&mut self, client_id: &str) -> Result<Option<StoredSession>, Error>;

    /// # Errors
    /// Returns error on backend failure.
    fn put_session(&mut self, session: StoredSession, ttl: Option<Duration>) -> Result<(), Error>;

    /// # Errors
    /// Returns error on backend failure.
    fn delete_session(&mut self, client_id: &str) -> Result<(), Error>;

    /// # Errors
    /// Returns error on backend failure.
    fn get_retained(&mut self, topic: &str) -> Result<Option<PublishPacket>, Error>;

    /// # Errors
    /// Returns error on backend failure.
    fn put_retained(&mut self, packet: PublishPacket) -> Result<(), Error>;

    /// # Errors
    /// Returns error on backend failure.
    fn delete_retained(&mut self, topic: &str) -> Result<(), Error>;

    /// # Errors
    /// Returns error on backend failure.
    fn match_retained(&mut self, filter: &TopicFilter) -> Result<Vec<PublishPacket>, Error>;

    /// Append a routed message to the replay collection.
    ///
    /// # Errors
    /// Returns error on backend failure.
    fn put_message(&mut self, packet: PublishPacket, ttl: Option<Duration>) -> Result<(), Error>;

    /// # Errors
    /// Returns error on backend failure.
    fn stats(&mut self) -> Result<StoreStats, Error>;

    /// Drop entries whose TTL elapsed.
    ///
    /// # Errors
    /// Returns error on backend failure.
    fn purge_expired(&mut self) -> Result<(), Error>;
}

/// Build the configured backend.
#[must_use]
pub fn new_backend(config: &Storage) -> Box<dyn StoreBackend> {
    match config.storage_type() {
        StorageType::Memory => Box::new(MemoryStore::new()),
        StorageType::Database => {
            // External database backends are plugged in by deployments; the
            // builtin fallback keeps everything in memory.
            log::warn!("store: No database backend compiled in, falling back to memory");
            Box::new(MemoryStore::new())
        }
    }
}
