// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! `ServerContext` is the main entry point of the weir broker.

use std::fs::File;
use std::io::{Read, Write};
use tokio::runtime::Runtime;

use crate::config::Config;
use crate::error::{Error, ErrorKind};

mod init;
pub mod run;

pub const CHANNEL_CAPACITY: usize = 16;

/// `ServerContext` manages the lifetime of dispatcher, listeners, auth and
/// metrics modules.
///
/// All kernel signals are handled here.
#[allow(clippy::module_name_repetitions)]
pub struct ServerContext {
    config: Config,
}

impl ServerContext {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Send `SIGUSR1` signal to running process.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Failed to read pid from file
    /// - Failed to find that process
    pub fn send_reload_signal(&mut self) -> Result<(), Error> {
        #[cfg(unix)]
        return self.send_signal(nc::SIGUSR1);

        #[cfg(not(unix))]
        return self.send_signal(0);
    }

    /// Send `SIGTERM` signal to running process.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Failed to read pid from file
    /// - Failed to find that process
    pub fn send_stop_signal(&mut self) -> Result<(), Error> {
        #[cfg(unix)]
        return self.send_signal(nc::SIGTERM);

        #[cfg(not(unix))]
        return self.send_signal(0);
    }

    /// Notify server process by sending a signal.
    #[cfg(not(unix))]
    #[allow(clippy::unnecessary_wraps)]
    fn send_signal(&mut self, _sig: i32) -> Result<(), Error> {
        Ok(())
    }

    /// Notify server process by sending a signal.
    #[cfg(unix)]
    fn send_signal(&mut self, sig: i32) -> Result<(), Error> {
        log::info!("send_signal() {sig}");
        let mut fd = File::open(self.config.general().pid_file())?;
        let mut pid_str = String::new();
        fd.read_to_string(&mut pid_str)?;
        let pid = pid_str.trim().parse::<i32>().map_err(|err| {
            Error::from_string(
                ErrorKind::PidError,
                format!(
                    "Failed to parse pid {} from file {:?}, err: {:?}",
                    pid_str,
                    self.config.general().pid_file(),
                    err
                ),
            )
        })?;

        unsafe {
            nc::kill(pid, sig).map_err(|err| {
                Error::from_string(
                    ErrorKind::PidError,
                    format!("Failed to notify process {}, got {}", pid, nc::strerror(err)),
                )
            })?;
        }
        Ok(())
    }

    fn write_pid(&self) -> Result<(), Error> {
        let pid_file = self.config.general().pid_file();
        if pid_file.as_os_str().is_empty() {
            return Ok(());
        }
        let pid = std::process::id();
        let mut fd = File::create(pid_file).map_err(|err| {
            Error::from_string(
                ErrorKind::IoError,
                format!("Failed to write pid to file {pid_file:?}, got err: {err:?}"),
            )
        })?;
        write!(fd, "{pid}")?;
        Ok(())
    }

    /// Init modules and run until a terminating signal arrives.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Server config is invalid
    /// - Failed to write pid to file
    /// - Failed to init inner modules
    pub fn run_loop(&mut self, runtime: &Runtime) -> Result<(), Error> {
        if let Err(err) = self.config.validate(false) {
            eprintln!("Failed to validate config file!");
            return Err(err);
        }

        self.write_pid()?;

        runtime.block_on(async {
            self.init_modules().await?;
            Self::run_inner_loop().await
        })
    }

    #[cfg(unix)]
    async fn run_inner_loop() -> Result<(), Error> {
        use tokio::signal::unix::{signal, SignalKind};

        log::info!("ServerContext::run_inner_loop()");
        let mut sigusr1_stream = signal(SignalKind::user_defined1())?;
        let mut sigterm_stream = signal(SignalKind::terminate())?;
        let mut sigquit_stream = signal(SignalKind::quit())?;
        let mut sigint_stream = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                Some(()) = sigusr1_stream.recv() => {
                    // TODO(Shaohua): Reload config and send new config to other apps.
                    log::info!("Reload config");
                },
                Some(()) = sigterm_stream.recv() => {
                    log::info!("Quit with SIGTERM");
                    break;
                }
                Some(()) = sigquit_stream.recv() => {
                    log::info!("Quit with SIGQUIT");
                    break;
                }
                Some(()) = sigint_stream.recv() => {
                    log::info!("Quit with SIGINT");
                    break;
                }
            }
        }

        Ok(())
    }

    #[cfg(not(unix))]
    async fn run_inner_loop() -> Result<(), Error> {
        tokio::signal::ctrl_c().await?;
        log::info!("Quit with Ctrl-C");
        Ok(())
    }
}
