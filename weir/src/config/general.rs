// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// General section in config.
#[derive(Debug, Deserialize, Clone)]
pub struct General {
    /// Time interval to log broker counters in seconds.
    ///
    /// Set to 0 to disable counter logs.
    ///
    /// Default is 60.
    #[serde(default = "General::default_sys_interval")]
    sys_interval: u64,

    /// Number of worker threads in the async runtime.
    ///
    /// Set to 0 to use the number of available cpu cores.
    ///
    /// Default is 0.
    #[serde(default = "General::default_workers")]
    workers: usize,

    /// Write process id to a file. A blank string means a pid file shouldn't
    /// be written.
    ///
    /// Default is `/run/weir.pid` for root user,
    /// and `/tmp/weir.pid` for non-root users.
    #[serde(default = "General::default_pid_file")]
    pid_file: PathBuf,
}

impl General {
    #[must_use]
    pub const fn default_sys_interval() -> u64 {
        60
    }

    #[must_use]
    pub const fn default_workers() -> usize {
        0
    }

    #[cfg(unix)]
    #[must_use]
    pub fn default_pid_file() -> PathBuf {
        let uid = unsafe { nc::geteuid() };
        if uid == 0 {
            PathBuf::from("/run/weir.pid")
        } else {
            PathBuf::from("/tmp/weir.pid")
        }
    }

    #[cfg(not(unix))]
    #[must_use]
    pub fn default_pid_file() -> PathBuf {
        PathBuf::from("weir.pid")
    }

    #[must_use]
    pub const fn sys_interval(&self) -> u64 {
        self.sys_interval
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn pid_file(&self) -> &Path {
        self.pid_file.as_path()
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

impl Default for General {
    fn default() -> Self {
        Self {
            sys_interval: Self::default_sys_interval(),
            workers: Self::default_workers(),
            pid_file: Self::default_pid_file(),
        }
    }
}
