// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssl::hash::{Hasher, MessageDigest};
use rand::Rng;

use crate::error::{Error, ErrorKind};

pub const SALT_LEN: usize = 12;

/// One salted password entry.
///
/// The file line format is `username:salt:hash`, salt and hash base64
/// encoded, hash is SHA-512 over password bytes followed by salt bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passwd {
    salt: Vec<u8>,
    passwd_hash: Vec<u8>,
}

impl Passwd {
    /// Hash `passwd` with a random salt.
    ///
    /// # Errors
    ///
    /// Returns error if the hash operation fails.
    pub fn generate(passwd: &[u8]) -> Result<Self, Error> {
        let salt: [u8; SALT_LEN] = rand::thread_rng().gen();
        let passwd_hash = Self::hash_with_salt(passwd, &salt)?;
        Ok(Self {
            salt: salt.to_vec(),
            passwd_hash,
        })
    }

    fn hash_with_salt(passwd: &[u8], salt: &[u8]) -> Result<Vec<u8>, Error> {
        let mut hasher = Hasher::new(MessageDigest::sha512())?;
        hasher.update(passwd)?;
        hasher.update(salt)?;
        let digest = hasher.finish()?;
        Ok(digest.to_vec())
    }

    /// Check `passwd` against the stored hash.
    #[must_use]
    pub fn is_match(&self, passwd: &[u8]) -> bool {
        Self::hash_with_salt(passwd, &self.salt)
            .map(|hash| hash == self.passwd_hash)
            .unwrap_or(false)
    }

    /// Parse one password file line.
    ///
    /// Returns None for blank lines and comments.
    ///
    /// # Errors
    ///
    /// Returns error if the line is malformed.
    pub fn parse(line: &str) -> Result<Option<(String, Self)>, Error> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut parts = line.splitn(3, ':');
        let (Some(username), Some(salt), Some(hash)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::from_string(
                ErrorKind::AuthError,
                format!("Invalid passwd entry: {line:?}"),
            ));
        };
        if username.is_empty() {
            return Err(Error::new(ErrorKind::AuthError, "Empty username"));
        }

        let salt = BASE64.decode(salt).map_err(|err| {
            Error::from_string(ErrorKind::AuthError, format!("Invalid salt: {err}"))
        })?;
        let passwd_hash = BASE64.decode(hash).map_err(|err| {
            Error::from_string(ErrorKind::AuthError, format!("Invalid hash: {err}"))
        })?;

        Ok(Some((username.to_string(), Self { salt, passwd_hash })))
    }

    /// Serialize the entry as one password file line.
    #[must_use]
    pub fn dump(&self, username: &str) -> String {
        format!(
            "{}:{}:{}",
            username,
            BASE64.encode(&self.salt),
            BASE64.encode(&self.passwd_hash)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_match() {
        let passwd = Passwd::generate(b"secret").unwrap();
        assert!(passwd.is_match(b"secret"));
        assert!(!passwd.is_match(b"wrong"));
    }

    #[test]
    fn test_dump_parse_round_trip() {
        let passwd = Passwd::generate(b"secret").unwrap();
        let line = passwd.dump("alice");

        let (username, parsed) = Passwd::parse(&line).unwrap().unwrap();
        assert_eq!(username, "alice");
        assert_eq!(parsed, passwd);
        assert!(parsed.is_match(b"secret"));
    }

    #[test]
    fn test_parse_skips_comments() {
        assert!(Passwd::parse("").unwrap().is_none());
        assert!(Passwd::parse("# comment").unwrap().is_none());
        assert!(Passwd::parse("missing-fields").is_err());
    }
}
