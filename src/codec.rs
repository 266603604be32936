//! Record-separator framing for the chat hub socket.
//!
//! Every message in both directions is a JSON document followed by the
//! ASCII record separator (`0x1E`). One network frame may carry several
//! documents, and trailing separators are common.

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Result;

/// Terminator appended to every JSON document on the wire.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Protocol-level frames the client sends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// `{"protocol":"json","version":1}`, the first frame of a connection.
    Handshake,
    /// `{"type":6}`, keep-alive in both directions.
    Ping,
    /// `{"type":7}`, echoed back when the service sends it.
    Ack,
}

impl ControlFrame {
    pub fn to_value(self) -> Value {
        match self {
            Self::Handshake => json!({"protocol": "json", "version": 1}),
            Self::Ping => json!({"type": 6}),
            Self::Ack => json!({"type": 7}),
        }
    }

    /// Wire form of the frame, separator included.
    pub fn encode(self) -> String {
        let mut out = self.to_value().to_string();
        out.push(RECORD_SEPARATOR);
        out
    }
}

/// Serialize `message` and terminate it with the record separator.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<String> {
    let mut out = serde_json::to_string(message)?;
    out.push(RECORD_SEPARATOR);
    Ok(out)
}

/// Split a network frame into its JSON documents.
///
/// Empty segments are dropped silently.
pub fn decode(raw: &str) -> Result<Vec<Value>> {
    raw.split(RECORD_SEPARATOR)
        .filter(|segment| !segment.trim().is_empty())
        .map(|segment| serde_json::from_str(segment).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_appends_single_separator() {
        let wire = encode(&json!({"type": 4})).unwrap();
        assert_eq!(wire, "{\"type\":4}\u{1e}");
        assert_eq!(ControlFrame::Ping.encode(), "{\"type\":6}\u{1e}");
        assert_eq!(
            ControlFrame::Handshake.encode(),
            "{\"protocol\":\"json\",\"version\":1}\u{1e}"
        );
    }

    #[test]
    fn decode_splits_coalesced_documents() {
        let raw = "{\"type\":6}\u{1e}{\"type\":1,\"target\":\"update\"}\u{1e}";
        let frames = decode(raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], 6);
        assert_eq!(frames[1]["target"], "update");
    }

    #[test]
    fn decode_drops_empty_segments() {
        assert!(decode("\u{1e}\u{1e}").unwrap().is_empty());
        assert_eq!(decode("{}\u{1e}\u{1e}{}").unwrap().len(), 2);
    }

    #[test]
    fn decode_rejects_malformed_document() {
        assert!(decode("{\"type\":\u{1e}").is_err());
    }
}
