//! Key and subject namespace on the Redis fabric.
//!
//! # Key Patterns
//!
//! - `node:{node_id}` - serialized node record (rewritten each heartbeat)
//! - `nodes` - set of registered node ids
//! - `room_node:{room_name}` - id of the room's RTC owner (set-if-absent)
//!
//! # Subjects
//!
//! - `rtc.{room_name}` - `RtcNodeMessage`, consumed by the room's RTC owner
//! - `signal.{connection_id}` - `SignalNodeMessage`, consumed by the
//!   connection's signal node

/// Set holding every registered node id.
pub const NODES_SET_KEY: &str = "nodes";

pub fn node_key(node_id: &str) -> String {
    format!("node:{node_id}")
}

pub fn room_node_key(room_name: &str) -> String {
    format!("room_node:{room_name}")
}

pub fn rtc_subject(room_name: &str) -> String {
    format!("rtc.{room_name}")
}

pub fn signal_subject(connection_id: &str) -> String {
    format!("signal.{connection_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(node_key("nd-host-1"), "node:nd-host-1");
        assert_eq!(room_node_key("roomA"), "room_node:roomA");
        assert_eq!(NODES_SET_KEY, "nodes");
    }

    #[test]
    fn test_subject_formats() {
        assert_eq!(rtc_subject("roomA"), "rtc.roomA");
        assert_eq!(
            signal_subject("8d5e6c2a-3a71-4a1e-9f6e-1f0b6f7f2a11"),
            "signal.8d5e6c2a-3a71-4a1e-9f6e-1f0b6f7f2a11"
        );
    }
}
