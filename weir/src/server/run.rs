// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::runtime::{Builder, Runtime};

use super::ServerContext;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::log::init_log;

pub const DEFAULT_CONFIG: &str = "/etc/weir/weir.toml";

#[derive(Debug, Parser)]
#[command(name = "weir", about = "High performance MQTT 3.1.1 broker")]
struct Args {
    /// Specify config file path.
    #[arg(short, long, value_name = "config_file")]
    config: Option<PathBuf>,

    /// Reload config of a running server.
    #[arg(short, long)]
    reload: bool,

    /// Stop a running server.
    #[arg(short, long)]
    stop: bool,

    /// Test config file and exit.
    #[arg(short, long)]
    test: bool,
}

fn new_runtime(workers: usize) -> Result<Runtime, Error> {
    let mut builder = Builder::new_multi_thread();
    builder.enable_all();
    if workers > 0 {
        builder.worker_threads(workers);
    }
    builder.build().map_err(Into::into)
}

/// Entry point of server.
///
/// # Errors
///
/// Returns error if config is invalid or some socket addresses are
/// unavailable.
pub fn run_server() -> Result<(), Error> {
    let args = Args::parse();

    let config_file = if let Some(config_file) = &args.config {
        Some(config_file.clone())
    } else if Path::new(DEFAULT_CONFIG).exists() {
        Some(PathBuf::from(DEFAULT_CONFIG))
    } else {
        None
    };

    let config = if let Some(config_file) = config_file {
        let config_content = std::fs::read_to_string(&config_file)?;
        let config: Config = toml::from_str(&config_content).map_err(|err| {
            Error::from_string(ErrorKind::ConfigError, format!("Invalid config: {err:?}"))
        })?;

        config.validate(false)?;

        if args.test {
            println!(
                "The configuration file {} syntax is Ok",
                config_file.display()
            );
            return Ok(());
        }
        config
    } else {
        Config::default()
    };

    init_log(config.log())?;

    let mut server = ServerContext::new(config);

    if args.reload {
        return server.send_reload_signal();
    }

    if args.stop {
        return server.send_stop_signal();
    }

    let runtime = new_runtime(server.config.general().workers())?;
    server.run_loop(&runtime)
}

/// Run server with predefined config.
///
/// Useful for integration tests.
///
/// # Errors
///
/// Returns error if config is invalid or some socket addresses are
/// unavailable.
pub fn run_server_with_config(config: Config) -> Result<(), Error> {
    init_log(config.log())?;
    let workers = config.general().workers();
    let mut server = ServerContext::new(config);
    let runtime = new_runtime(workers)?;
    server.run_loop(&runtime)
}
