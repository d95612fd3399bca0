// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Maintain weir password files.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use weir::auth::file_auth::add_delete_users;
use weir::error::Error;

#[derive(Debug, Parser)]
#[command(name = "weir-passwd", about = "Manage password files for the weir broker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a user to the password file, or update its password.
    Add {
        /// Path to password file.
        passwd_file: PathBuf,

        username: String,

        /// Password in clear text; it is stored salted and hashed.
        password: String,
    },

    /// Delete a user from the password file.
    Delete {
        /// Path to password file.
        passwd_file: PathBuf,

        username: String,
    },
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    match args.command {
        Command::Add {
            passwd_file,
            username,
            password,
        } => add_delete_users(passwd_file, &[(&username, &password)], &[]),
        Command::Delete {
            passwd_file,
            username,
        } => add_delete_users(passwd_file, &[], &[&username]),
    }
}
