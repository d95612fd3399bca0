// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use super::passwd::Passwd;
use crate::error::{Error, ErrorKind};

/// Username/password database loaded from a password file.
#[derive(Debug, Clone, Default)]
pub struct FileAuth {
    users: BTreeMap<String, Passwd>,
}

impl FileAuth {
    /// Load a password file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or contains malformed lines.
    pub fn new<P: AsRef<Path>>(passwd_file: P) -> Result<Self, Error> {
        let fd = File::open(passwd_file.as_ref())?;
        let reader = BufReader::new(fd);
        let mut users = BTreeMap::new();
        for line in reader.lines() {
            let line = line?;
            match Passwd::parse(&line) {
                Err(err) => {
                    log::error!("auth: err: {err:?}, line: {line}");
                    return Err(err);
                }
                Ok(None) => {
                    // continue
                }
                Ok(Some((username, passwd))) => {
                    users.insert(username, passwd);
                }
            }
        }
        Ok(Self { users })
    }

    /// Check credentials against the database.
    #[must_use]
    pub fn is_match(&self, username: &str, password: &[u8]) -> bool {
        self.users
            .get(username)
            .is_some_and(|passwd| passwd.is_match(password))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Add and delete users in a password file, creating it when absent.
///
/// `add_users` entries have the form `username:password`, with the password
/// in clear text; it is hashed here.
///
/// # Errors
///
/// Returns error if the file cannot be read or written, or entries are
/// malformed.
pub fn add_delete_users<P: AsRef<Path>>(
    passwd_file: P,
    add_users: &[(&str, &str)],
    delete_users: &[&str],
) -> Result<(), Error> {
    let fd = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(passwd_file.as_ref())?;
    let reader = BufReader::new(fd);
    let mut users = BTreeMap::new();
    for line in reader.lines() {
        let line = line?;
        match Passwd::parse(&line) {
            Err(err) => {
                log::error!("auth: Failed to parse line {line:?}, got err: {err:?}");
                return Err(err);
            }
            Ok(None) => {
                // continue
            }
            Ok(Some((username, passwd))) => {
                users.insert(username, passwd);
            }
        }
    }

    // Add/update users.
    for (username, password) in add_users {
        if username.is_empty() || username.contains(':') {
            return Err(Error::from_string(
                ErrorKind::AuthError,
                format!("Invalid username to add: {username:?}"),
            ));
        }
        let passwd = Passwd::generate(password.as_bytes())?;
        users.insert((*username).to_string(), passwd);
    }

    // Delete users.
    for username in delete_users {
        if username.contains(':') {
            return Err(Error::from_string(
                ErrorKind::AuthError,
                format!("Invalid username to delete: {username:?}"),
            ));
        }
        users.remove(*username);
    }

    let mut fd = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(passwd_file.as_ref())?;
    for (username, passwd) in users {
        let line = passwd.dump(&username);
        fd.write_all(line.as_bytes())?;
        fd.write_all(b"\n")?;
    }

    Ok(())
}
