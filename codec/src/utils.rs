// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Length of string exceeds 65535 bytes.
    TooManyData,

    /// Contains null character or other disallowed code points.
    InvalidChar,
}

/// Check whether `s` is a valid UTF-8 string usable in control packets.
///
/// The character data in a UTF-8 Encoded String MUST be well-formed UTF-8 as
/// defined by the Unicode specification. A UTF-8 Encoded String MUST NOT include
/// an encoding of the null character U+0000 [MQTT-1.5.3-2].
///
/// # Errors
///
/// Returns error if `s` is too long or contains disallowed characters.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooManyData);
    }
    if s.chars().any(|c| c == '\u{0}') {
        return Err(StringError::InvalidChar);
    }
    Ok(())
}

/// Convert `bytes` into an owned string after validation.
///
/// # Errors
///
/// Returns error if `bytes` is not a valid UTF-8 string.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_err| StringError::InvalidChar)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// No chars.
    IsEmpty,

    /// Larger than 23 chars.
    TooLong,

    /// Can only contain 0-9a-zA-Z and a few punctuation chars.
    InvalidChars,
}

/// Check whether `client_id` conforms to [MQTT-3.1.3-5].
///
/// The Server MUST allow ClientIds which are between 1 and 23 UTF-8 encoded
/// bytes in length, and that contain only the characters
/// "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ".
///
/// Hyphen and underscore are also accepted as most client libraries generate
/// ids of that form.
///
/// # Errors
///
/// Returns error if `client_id` is invalid.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.is_empty() {
        return Err(ClientIdError::IsEmpty);
    }
    if client_id.len() > 23 {
        return Err(ClientIdError::TooLong);
    }
    if client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(ClientIdError::InvalidChars)
    }
}

/// Generate random alphanumeric string with `len` bytes.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a random client id on behalf of a client which supplied an empty one.
#[must_use]
pub fn random_client_id() -> String {
    format!("weir-{}", random_string(18))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("sensors/temp").is_ok());
        assert!(validate_utf8_string("with\u{0}null").is_err());
    }

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("client-01").is_ok());
        assert_eq!(validate_client_id(""), Err(ClientIdError::IsEmpty));
        assert_eq!(
            validate_client_id("0123456789012345678901234"),
            Err(ClientIdError::TooLong)
        );
        assert_eq!(
            validate_client_id("has space"),
            Err(ClientIdError::InvalidChars)
        );
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id();
        assert!(validate_client_id(&id).is_ok());
    }
}
