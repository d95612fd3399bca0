// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::time::Duration;

use crate::error::Error;

/// Kind of persistent store backend.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Keep session and retained state in process memory only.
    #[serde(alias = "memory")]
    Memory,

    /// An external key/value database. Reserved for deployments which plug in
    /// their own backend; the builtin backend is in-memory.
    #[serde(alias = "database")]
    Database,
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    /// Mirror session and retained message state into the persistent store.
    ///
    /// Default is true.
    #[serde(default = "Storage::default_persistence")]
    persistence: bool,

    /// Which store backend to use.
    ///
    /// Default is memory.
    #[serde(default = "Storage::default_storage_type")]
    storage_type: StorageType,

    /// The maximum number of retained messages kept by the broker.
    ///
    /// A retained publish arriving when the store is full is dropped and
    /// counted. 0 means unlimited.
    ///
    /// Default is 10000.
    #[serde(default = "Storage::default_retained_message_limit")]
    retained_message_limit: usize,

    /// Seconds a disconnected persistent session is kept before it is removed
    /// by the expiry sweep.
    ///
    /// Default is 3600.
    #[serde(default = "Storage::default_session_expiry")]
    session_expiry: u64,

    /// The maximum number of messages queued for a disconnected persistent
    /// session. On overflow the oldest message is dropped and counted.
    ///
    /// Default is 1000.
    #[serde(default = "Storage::default_message_queue_limit")]
    message_queue_limit: usize,
}

impl Storage {
    #[must_use]
    pub const fn default_persistence() -> bool {
        true
    }

    #[must_use]
    pub const fn default_storage_type() -> StorageType {
        StorageType::Memory
    }

    #[must_use]
    pub const fn default_retained_message_limit() -> usize {
        10_000
    }

    #[must_use]
    pub const fn default_session_expiry() -> u64 {
        3600
    }

    #[must_use]
    pub const fn default_message_queue_limit() -> usize {
        1000
    }

    #[must_use]
    pub const fn persistence(&self) -> bool {
        self.persistence
    }

    #[must_use]
    pub const fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    #[must_use]
    pub const fn retained_message_limit(&self) -> usize {
        self.retained_message_limit
    }

    #[must_use]
    pub const fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry)
    }

    #[must_use]
    pub const fn message_queue_limit(&self) -> usize {
        self.message_queue_limit
    }

    /// Validate storage config.
    ///
    /// # Errors
    ///
    /// Does nothing currently.
    pub const fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            persistence: Self::default_persistence(),
            storage_type: Self::default_storage_type(),
            retained_message_limit: Self::default_retained_message_limit(),
            session_expiry: Self::default_session_expiry(),
            message_queue_limit: Self::default_message_queue_limit(),
        }
    }
}
