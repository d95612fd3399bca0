// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Error;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(alias = "off")]
    Off,

    #[serde(alias = "error")]
    Error,

    #[serde(alias = "warn")]
    Warn,

    #[serde(alias = "info")]
    Info,

    #[serde(alias = "debug")]
    Debug,

    #[serde(alias = "trace")]
    Trace,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    /// Log level filter.
    ///
    /// Default is info.
    #[serde(default = "Log::default_log_level")]
    log_level: LogLevel,

    /// Path to log file. The file is rolled and compressed when it grows
    /// beyond a fixed size.
    ///
    /// Default is "/var/log/weir/weir.log" for root user,
    /// and "/tmp/weir.log" for non-root users.
    #[serde(default = "Log::default_log_file")]
    log_file: PathBuf,
}

impl Log {
    #[must_use]
    pub const fn default_log_level() -> LogLevel {
        LogLevel::Info
    }

    #[cfg(unix)]
    #[must_use]
    pub fn default_log_file() -> PathBuf {
        let uid = unsafe { nc::geteuid() };
        if uid == 0 {
            PathBuf::from("/var/log/weir/weir.log")
        } else {
            PathBuf::from("/tmp/weir.log")
        }
    }

    #[cfg(not(unix))]
    #[must_use]
    pub fn default_log_file() -> PathBuf {
        PathBuf::from("weir.log")
    }

    #[must_use]
    pub const fn log_level(&self) -> LogLevel {
        self.log_level
    }

    #[must_use]
    pub fn log_file(&self) -> &Path {
        self.log_file.as_path()
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Does nothing currently.
    pub const fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_file: Self::default_log_file(),
        }
    }
}
