//! Intent-level text operations.
//!
//! Operations address text by UTF-16 code-unit offsets. Inside a batch every
//! position is relative to a running cursor, so a delta such as
//! `[retain 5, insert " world"]` reads left to right like a replay script.
//! A single operation starts from cursor 0, which makes its position absolute.

use serde::{Deserialize, Serialize};

/// One edit intent against the current text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    Insert { position: u32, content: String },
    Delete { position: u32, length: u32 },
    Retain { position: u32, length: u32 },
}

impl Operation {
    pub fn insert(position: u32, content: impl Into<String>) -> Self {
        Operation::Insert {
            position,
            content: content.into(),
        }
    }

    pub fn delete(position: u32, length: u32) -> Self {
        Operation::Delete { position, length }
    }

    pub fn retain(length: u32) -> Self {
        Operation::Retain {
            position: 0,
            length,
        }
    }

    pub fn position(&self) -> u32 {
        match self {
            Operation::Insert { position, .. }
            | Operation::Delete { position, .. }
            | Operation::Retain { position, .. } => *position,
        }
    }

    /// Whether applying this operation changes the text.
    pub fn is_mutation(&self) -> bool {
        match self {
            Operation::Insert { content, .. } => !content.is_empty(),
            Operation::Delete { length, .. } => *length > 0,
            Operation::Retain { .. } => false,
        }
    }
}

/// Length of `s` in UTF-16 code units, the unit every offset is expressed in.
pub fn utf16_len(s: &str) -> u32 {
    s.encode_utf16().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf16_len() {
        assert_eq!(utf16_len("hello"), 5);
        assert_eq!(utf16_len(""), 0);
        // U+1F600 is a surrogate pair.
        assert_eq!(utf16_len("a\u{1F600}"), 3);
    }

    #[test]
    fn test_wire_shape() {
        let op = Operation::insert(3, "abc");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["position"], 3);
        assert_eq!(json["content"], "abc");

        let parsed: Operation =
            serde_json::from_str(r#"{"type":"delete","position":1,"length":2}"#).unwrap();
        assert_eq!(parsed, Operation::delete(1, 2));
    }

    #[test]
    fn test_is_mutation() {
        assert!(Operation::insert(0, "x").is_mutation());
        assert!(!Operation::insert(0, "").is_mutation());
        assert!(!Operation::delete(0, 0).is_mutation());
        assert!(!Operation::retain(4).is_mutation());
    }
}
