//! Control-plane message types multiplexed onto the client transport.
//!
//! Every message is a binary frame whose first byte is `0x00`; the
//! remainder is the UTF-8 JSON encoding of one of these variants, tagged by
//! its `type` field (§4.7). Matching is exhaustive on both directions: no
//! reflection-based dispatch table, per the REDESIGN notes in `spec.md` §9.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;

/// The leading byte that marks a transport frame as a control message
/// rather than opaque upstream payload (§6).
pub const CONTROL_PREFIX: u8 = 0x00;

/// Messages the proxy sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerControlMessage {
    /// Sent once, immediately after a fresh session is created.
    #[serde(rename_all = "camelCase")]
    Session {
        session_id: String,
        config: SessionConfig,
    },
    /// Sent on a successful reattach, before the buffer is drained.
    #[serde(rename_all = "camelCase")]
    Reconnected {
        session_id: String,
        buffered_count: usize,
    },
    /// Sent when a reattach fails (unknown session id). The transport is
    /// closed immediately afterwards.
    Error { error: String },
    /// Acknowledges an `updateConfig` request with the clamped values that
    /// actually took effect.
    ConfigUpdated { config: SessionConfig },
}

/// Messages the client sends to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientControlMessage {
    /// Requests new per-session limits. Unknown keys are ignored by the
    /// schema itself (`serde` simply does not look for them); out-of-range
    /// known values are clamped, never rejected.
    #[serde(rename_all = "camelCase")]
    UpdateConfig {
        #[serde(default)]
        persistence_timeout: Option<u64>,
        #[serde(default)]
        max_buffer_lines: Option<u64>,
    },
}

/// Splits an inbound transport frame into a control message or opaque
/// bytes, per the `0x00`-prefix convention (§6). Returns `None` when the
/// frame is empty (treated as a zero-length opaque payload).
#[must_use]
pub fn classify_frame(frame: &[u8]) -> FrameKind<'_> {
    match frame.split_first() {
        Some((&CONTROL_PREFIX, rest)) => FrameKind::Control(rest),
        Some(_) => FrameKind::Opaque(frame),
        None => FrameKind::Opaque(frame),
    }
}

/// Classification result of [`classify_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind<'a> {
    /// Remainder is the UTF-8 JSON payload of a control message.
    Control(&'a [u8]),
    /// Opaque bytes bound for (or received from) the upstream socket.
    Opaque(&'a [u8]),
}

/// Serializes a [`ServerControlMessage`] into a transport frame: the
/// `0x00` prefix followed by its JSON encoding.
#[must_use]
pub fn encode_server_message(message: &ServerControlMessage) -> Vec<u8> {
    let json = serde_json::to_vec(message).expect("ServerControlMessage always serializes");
    let mut frame = Vec::with_capacity(json.len() + 1);
    frame.push(CONTROL_PREFIX);
    frame.extend_from_slice(&json);
    frame
}

/// Parses the JSON remainder of an inbound control frame. Per §7
/// (`MalformedControlMessage`), callers must treat a parse failure as
/// "log and ignore the frame", never as a session-ending error.
pub fn decode_client_message(json: &[u8]) -> Result<ClientControlMessage, serde_json::Error> {
    serde_json::from_slice(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_control_vs_opaque() {
        assert_eq!(classify_frame(&[0x00, b'{', b'}']), FrameKind::Control(b"{}"));
        assert_eq!(classify_frame(b"hello\n"), FrameKind::Opaque(b"hello\n"));
        assert_eq!(classify_frame(&[]), FrameKind::Opaque(&[]));
    }

    #[test]
    fn session_message_round_trips_with_expected_field_names() {
        let message = ServerControlMessage::Session {
            session_id: "abc123".into(),
            config: SessionConfig::default(),
        };
        let frame = encode_server_message(&message);
        assert_eq!(frame[0], CONTROL_PREFIX);
        let json: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(json["type"], "session");
        assert_eq!(json["sessionId"], "abc123");
        assert_eq!(json["config"]["persistenceTimeout"], 300_000);
        assert_eq!(json["config"]["maxBufferLines"], 1_000);
    }

    #[test]
    fn reconnected_message_uses_buffered_count_field_name() {
        let message = ServerControlMessage::Reconnected {
            session_id: "s".into(),
            buffered_count: 5,
        };
        let frame = encode_server_message(&message);
        let json: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(json["type"], "reconnected");
        assert_eq!(json["bufferedCount"], 5);
    }

    #[test]
    fn update_config_ignores_unknown_keys() {
        let raw = br#"{"type":"updateConfig","persistenceTimeout":1000,"bogus":"x"}"#;
        let decoded = decode_client_message(raw).expect("parses despite unknown key");
        assert_eq!(
            decoded,
            ClientControlMessage::UpdateConfig {
                persistence_timeout: Some(1000),
                max_buffer_lines: None,
            }
        );
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        assert!(decode_client_message(b"{not json").is_err());
    }
}
