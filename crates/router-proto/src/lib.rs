//! Wire messages for the cross-node participant routing layer.
//!
//! This crate contains the protobuf message definitions used on the routing
//! fabric, written as `prost` derives so no protobuf toolchain is needed at
//! build time:
//!
//! - [`internal`] - node records and the node-to-node routing envelopes
//!
//! Fabric payloads (`RtcNodeMessage`, `SignalNodeMessage`) are encoded in
//! protocol-buffers wire format. Node records additionally implement serde so
//! the registry can keep them as JSON values in the key-value namespace.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

// Re-export prost traits for convenience
pub use prost::Message;

pub mod internal;

/// Separator between room name and identity in a participant key.
pub const PARTICIPANT_KEY_SEPARATOR: char = '|';

/// Build the participant key addressing a session pipe on the RTC side.
///
/// The key is `room_name + '|' + identity`; identity is unique within a room,
/// so the key is unique across the fleet.
pub fn participant_key(room_name: &str, identity: &str) -> String {
    format!("{room_name}{PARTICIPANT_KEY_SEPARATOR}{identity}")
}

/// Split a participant key back into `(room_name, identity)`.
///
/// Returns `None` for keys that do not contain the separator. Room names may
/// not contain `'|'`; identities may (the split is on the first separator).
pub fn split_participant_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(PARTICIPANT_KEY_SEPARATOR)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_key_format() {
        assert_eq!(participant_key("roomA", "alice"), "roomA|alice");
        assert_eq!(participant_key("", ""), "|");
    }

    #[test]
    fn test_split_participant_key_round_trip() {
        let key = participant_key("roomA", "alice");
        assert_eq!(split_participant_key(&key), Some(("roomA", "alice")));
    }

    #[test]
    fn test_split_participant_key_identity_with_separator() {
        // The split is on the first separator, so identities keep any
        // embedded separator intact.
        assert_eq!(
            split_participant_key("roomA|user|7"),
            Some(("roomA", "user|7"))
        );
    }

    #[test]
    fn test_split_participant_key_malformed() {
        assert_eq!(split_participant_key("no-separator"), None);
        assert_eq!(split_participant_key(""), None);
    }
}
