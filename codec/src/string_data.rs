// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::utils::{validate_utf8_string, StringError};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Text fields within the MQTT Control Packets are encoded as UTF-8 strings.
///
/// String Data is represented by a Two Byte Integer length which indicates
/// the number of data bytes, followed by the characters. Thus, the length of
/// String Data is limited to the range of 0 to 65,535 Bytes.
///
/// ```txt
/// +-------------------+
/// | String Length     |
/// |                   |
/// +-------------------+
/// | String ...        |
/// +-------------------+
/// ```
///
/// A UTF-8 Encoded String MUST NOT include an encoding of the null character
/// U+0000 [MQTT-1.5.3-2].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringData(String);

impl StringData {
    /// Create an empty string data object.
    #[must_use]
    pub const fn new() -> Self {
        Self(String::new())
    }

    /// Create a new string data object from `s`.
    ///
    /// # Errors
    ///
    /// Returns error if `s` is too long or contains invalid characters.
    pub fn from(s: &str) -> Result<Self, StringError> {
        validate_utf8_string(s)?;
        Ok(Self(s.to_string()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for StringData {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for StringData {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(usize::from(len))?;
        validate_utf8_string(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for StringData {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_data_round_trip() {
        let s = StringData::from("MQTT").unwrap();
        let mut buf = Vec::new();
        assert_eq!(s.encode(&mut buf), Ok(6));
        assert_eq!(&buf, &[0x00, 0x04, b'M', b'Q', b'T', b'T']);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(StringData::decode(&mut ba), Ok(s));
    }

    #[test]
    fn test_string_data_rejects_overrun() {
        // Declared length is larger than available bytes.
        let buf = [0x00, 0x05, b'a', b'b'];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(StringData::decode(&mut ba), Err(DecodeError::OutOfRange));
    }
}
