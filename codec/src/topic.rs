// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    EmptyTopic,
    TooManyData,
    InvalidChar,
    ContainsWildChar,
}

/// One level of a topic filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopicPart {
    /// Normal part.
    Normal(String),

    /// Empty part, from adjacent or leading/trailing separators.
    Empty,

    /// `#` char, to match this level and any remaining parts.
    MultiWildcard,

    /// `+` char, to match exactly one part.
    SingleWildcard,
}

impl TopicPart {
    fn has_wildcard(s: &str) -> bool {
        s.contains(|c| c == '#' || c == '+')
    }

    fn parse(s: &str) -> Result<Self, TopicError> {
        match s {
            "" => Ok(Self::Empty),
            "+" => Ok(Self::SingleWildcard),
            "#" => Ok(Self::MultiWildcard),
            _ => {
                if Self::has_wildcard(s) {
                    // "sport+" and "sport/tennis#" are not valid [MQTT-4.7.1-2/3].
                    Err(TopicError::ContainsWildChar)
                } else {
                    Ok(Self::Normal(s.to_string()))
                }
            }
        }
    }
}

/// A parsed topic filter, used to match concrete topic names.
///
/// Rules are defined in MQTT chapter-4.7, Topic Names and Topic Filters:
/// * Levels are separated by `/`.
/// * `+` matches exactly one level and must occupy an entire level.
/// * `#` matches the remaining levels including the parent, and must be
///   the last level of the filter.
#[derive(Debug, Default, Clone, Eq, PartialOrd, Ord, Hash)]
pub struct TopicFilter {
    filter: String,
    parts: Vec<TopicPart>,
}

impl PartialEq for TopicFilter {
    fn eq(&self, other: &Self) -> bool {
        self.filter.eq(&other.filter)
    }
}

impl TopicFilter {
    /// Parse `s` into a topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `s` violates topic filter rules.
    pub fn parse(s: &str) -> Result<Self, TopicError> {
        validate_sub_topic(s)?;
        let parts = s
            .split('/')
            .map(TopicPart::parse)
            .collect::<Result<Vec<_>, TopicError>>()?;
        Ok(Self {
            filter: s.to_string(),
            parts,
        })
    }

    /// Check whether concrete topic name `s` matches this filter.
    #[must_use]
    pub fn is_match(&self, s: &str) -> bool {
        let mut parts = self.parts.iter();
        for level in s.split('/') {
            match parts.next() {
                // "sport/tennis/#" also matches the parent level "sport/tennis",
                // and "#" on its own matches every topic [MQTT-4.7.1-2].
                Some(TopicPart::MultiWildcard) => return true,
                Some(TopicPart::SingleWildcard) => {}
                Some(TopicPart::Normal(part)) => {
                    if part != level {
                        return false;
                    }
                }
                Some(TopicPart::Empty) => {
                    if !level.is_empty() {
                        return false;
                    }
                }
                None => return false,
            }
        }

        match parts.next() {
            None => true,
            Some(TopicPart::MultiWildcard) => parts.next().is_none(),
            Some(_) => false,
        }
    }

    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    #[must_use]
    pub fn parts(&self) -> &[TopicPart] {
        &self.parts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filter.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }
}

/// Validate topic filter.
///
/// # Errors
///
/// Returns error if `topic` violates filter rules:
/// ```
/// use weir_codec::topic::validate_sub_topic;
/// assert!(validate_sub_topic("sport/tennis/player/#").is_ok());
/// assert!(validate_sub_topic("sport/tennis/player#").is_err());
/// assert!(validate_sub_topic("#").is_ok());
/// assert!(validate_sub_topic("sport/#/player/ranking").is_err());
/// assert!(validate_sub_topic("+").is_ok());
/// assert!(validate_sub_topic("sport+").is_err());
/// ```
pub fn validate_sub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    if topic.contains('\u{0}') {
        return Err(TopicError::InvalidChar);
    }

    for (index, level) in topic.split('/').enumerate() {
        match level {
            "+" => {}
            "#" => {
                // The multi-level wildcard MUST be the last character in
                // the topic filter [MQTT-4.7.1-2].
                if index != topic.split('/').count() - 1 {
                    return Err(TopicError::InvalidChar);
                }
            }
            _ => {
                if level.contains(|c| c == '+' || c == '#') {
                    return Err(TopicError::InvalidChar);
                }
            }
        }
    }

    Ok(())
}

/// Check whether topic name contains wildcard characters.
///
/// # Errors
///
/// Returns error if `topic` is not a valid topic name:
/// ```
/// use weir_codec::topic::validate_pub_topic;
/// assert!(validate_pub_topic("sport/tennis/player/#").is_err());
/// assert!(validate_pub_topic("sport/tennis/player/ranking").is_ok());
/// ```
pub fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    if topic.contains('\u{0}') {
        return Err(TopicError::InvalidChar);
    }

    // The topic name in a PUBLISH packet MUST NOT contain wildcard
    // characters [MQTT-3.3.2-2].
    if topic.contains(|c| c == '+' || c == '#') {
        Err(TopicError::ContainsWildChar)
    } else {
        Ok(())
    }
}

/// Topic name used in Publish packets, without wildcard characters.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new topic name object.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(usize::from(len))?;
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Topic filter used in Subscribe/Unsubscribe packets.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubTopic(String);

impl SubTopic {
    /// Create a new topic filter object.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_sub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(usize::from(len))?;
        // Wildcard placement is not checked here. A filter which violates
        // those rules gets a failure return code in the SubscribeAck packet
        // instead of tearing down the whole connection, so the broker decides
        // per filter with `TopicFilter::parse`.
        if s.is_empty() {
            return Err(DecodeError::InvalidTopic);
        }
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
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
    fn test_multi_wildcard_match() {
        let filter = TopicFilter::parse("a/#").unwrap();
        assert!(filter.is_match("a"));
        assert!(filter.is_match("a/b"));
        assert!(filter.is_match("a/b/c"));
        assert!(!filter.is_match("b"));
        assert!(!filter.is_match("ab"));

        let any = TopicFilter::parse("#").unwrap();
        assert!(any.is_match("a"));
        assert!(any.is_match("a/b/c"));
    }

    #[test]
    fn test_single_wildcard_match() {
        let filter = TopicFilter::parse("+/b").unwrap();
        assert!(filter.is_match("a/b"));
        assert!(!filter.is_match("a/b/c"));
        assert!(!filter.is_match("a/c"));

        let filter = TopicFilter::parse("sensors/+/temp").unwrap();
        assert!(filter.is_match("sensors/a/temp"));
        assert!(!filter.is_match("sensors/a/b/temp"));
    }

    #[test]
    fn test_exact_match() {
        let filter = TopicFilter::parse("a/b").unwrap();
        assert!(filter.is_match("a/b"));
        assert!(!filter.is_match("a/B"));
        assert!(!filter.is_match("a"));
        assert!(!filter.is_match("a/b/c"));
    }

    #[test]
    fn test_empty_levels() {
        let filter = TopicFilter::parse("a//b").unwrap();
        assert!(filter.is_match("a//b"));
        assert!(!filter.is_match("a/b"));

        let filter = TopicFilter::parse("/+").unwrap();
        assert!(filter.is_match("/finance"));
    }

    #[test]
    fn test_validate_sub_topic() {
        assert!(validate_sub_topic("sport/tennis/+").is_ok());
        assert!(validate_sub_topic("+/+").is_ok());
        assert_eq!(validate_sub_topic(""), Err(TopicError::EmptyTopic));
        assert_eq!(validate_sub_topic("sport+"), Err(TopicError::InvalidChar));
        assert_eq!(validate_sub_topic("a/#/b"), Err(TopicError::InvalidChar));
        assert_eq!(validate_sub_topic("a/b#"), Err(TopicError::InvalidChar));
    }

    #[test]
    fn test_validate_pub_topic() {
        assert!(validate_pub_topic("sensors/a/temp").is_ok());
        assert_eq!(validate_pub_topic(""), Err(TopicError::EmptyTopic));
        assert_eq!(
            validate_pub_topic("a/+/b"),
            Err(TopicError::ContainsWildChar)
        );
        assert_eq!(validate_pub_topic("a/#"), Err(TopicError::ContainsWildChar));
    }

    #[test]
    fn test_pub_topic_decode_rejects_wildcard() {
        let buf = [0x00, 0x03, b'a', b'/', b'#'];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(PubTopic::decode(&mut ba), Err(DecodeError::InvalidTopic));
    }
}
