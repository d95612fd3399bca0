// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

mod general;
mod listener;
mod log;
mod security;
mod storage;

pub use self::log::{Log, LogLevel};
pub use general::General;
pub use listener::{Listener, Protocol};
pub use security::Security;
pub use storage::{Storage, StorageType};

/// Server main config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "General::default")]
    general: General,

    #[serde(default = "Listener::default_listeners")]
    listeners: Vec<Listener>,

    #[serde(default = "Security::default")]
    security: Security,

    #[serde(default = "Storage::default")]
    storage: Storage,

    #[serde(default = "Log::default")]
    log: Log,
}

impl Config {
    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    #[must_use]
    pub const fn security(&self) -> &Security {
        &self.security
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some options in config are invalid.
    pub fn validate(&self, bind_address: bool) -> Result<(), Error> {
        self.general.validate()?;

        for listener in &self.listeners {
            listener.validate(bind_address)?;
        }

        self.security.validate()?;
        self.storage.validate()?;
        self.log.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listeners().len(), 1);
        assert_eq!(config.listeners()[0].address(), "0.0.0.0:1883");
        assert!(config.security().allow_anonymous());
    }

    #[test]
    fn test_parse_listeners() {
        let content = r#"
[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:1883"
maximum_connections = 128

[[listeners]]
protocol = "ws"
address = "127.0.0.1:2883"
path = "/mqtt"

[storage]
message_queue_limit = 16
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.listeners().len(), 2);
        assert_eq!(config.listeners()[0].maximum_connections(), 128);
        assert_eq!(config.listeners()[1].protocol(), Protocol::Ws);
        assert_eq!(config.listeners()[1].path(), Some("/mqtt"));
        assert_eq!(config.storage().message_queue_limit(), 16);
    }
}
