//! # Messages
//!
//! Payload and metadata carriers that flow from a listener through the
//! receiver into the pipeline, plus the transformations applied on the way
//! (compaction, masking, correlation id extraction).

pub mod compactor;
pub mod correlation;
pub mod masking;
pub mod session;
pub mod wrapper;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

pub use compactor::MessageCompactor;
pub use correlation::CorrelationIdExtractor;
pub use masking::MessageMasker;
pub use session::PipeLineSession;
pub use wrapper::{MessageWrapper, RawMessageWrapper, ReceivedMessage};

/// Materialized message payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    payload: Option<Vec<u8>>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Some(payload.into()),
        }
    }

    /// Message without a payload
    pub fn null() -> Self {
        Self { payload: None }
    }

    pub fn is_null(&self) -> bool {
        self.payload.is_none()
    }

    /// True for a null message and for an empty payload
    pub fn is_empty(&self) -> bool {
        self.payload.as_ref().map_or(true, |p| p.is_empty())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn as_string(&self) -> Option<Cow<'_, str>> {
        self.payload.as_deref().map(String::from_utf8_lossy)
    }

    /// Payload as text when it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.payload
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Payload size in bytes; `None` for a null message
    pub fn size(&self) -> Option<usize> {
        self.payload.as_ref().map(Vec::len)
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        self.payload
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_string() {
            Some(text) => write!(f, "{text}"),
            None => write!(f, "<null>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_and_empty() {
        let null = Message::null();
        assert!(null.is_null());
        assert!(null.is_empty());
        assert_eq!(null.size(), None);
        assert_eq!(null.to_string(), "<null>");

        let empty = Message::from("");
        assert!(!empty.is_null());
        assert!(empty.is_empty());
        assert_eq!(empty.size(), Some(0));
    }

    #[test]
    fn test_text_access() {
        let message = Message::from("<order id=\"1\"/>");
        assert_eq!(message.as_str(), Some("<order id=\"1\"/>"));
        assert_eq!(message.size(), Some(15));

        let binary = Message::from(vec![0xff, 0xfe]);
        assert_eq!(binary.as_str(), None);
        assert!(binary.as_string().is_some());
    }
}
