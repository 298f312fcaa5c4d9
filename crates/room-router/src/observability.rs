//! Metrics definitions for the routing layer.
//!
//! Names follow Prometheus conventions with a `router_` prefix. Only the
//! `metrics` facade is used here; the embedding process installs whatever
//! recorder it wants.
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `direction`: 2 values (request, response)
//! - `kind`: bounded by the RTC message kinds (5 values)

use metrics::{counter, gauge};

/// Direction of a session pipe channel, used as a metric label.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Direction {
    Request,
    Response,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// Record the number of signal-side pipes currently open on this node.
pub(crate) fn set_signal_pipes_active(count: usize) {
    gauge!("router_signal_pipes_active").set(count as f64);
}

/// Record the number of RTC-side pipes currently open on this node.
pub(crate) fn set_rtc_pipes_active(count: usize) {
    gauge!("router_rtc_pipes_active").set(count as f64);
}

/// Record a pipe closed because its bounded buffer overflowed.
pub(crate) fn record_overflow(direction: Direction) {
    counter!("router_pipe_overflows_total", "direction" => direction.as_str()).increment(1);
}

/// Record a control message routed toward an RTC owner.
pub(crate) fn record_rtc_message(kind: &'static str) {
    counter!("router_rtc_messages_total", "kind" => kind).increment(1);
}

/// Record node records deleted by the dead-node evictor.
pub(crate) fn record_dead_nodes_removed(count: usize) {
    counter!("router_dead_nodes_removed_total").increment(count as u64);
}

/// Record a fabric payload that failed to decode or matched no pipe.
pub(crate) fn record_protocol_error() {
    counter!("router_protocol_errors_total").increment(1);
}

/// Bounded label for control-message metrics.
pub(crate) fn rtc_message_kind(
    message: &router_proto::internal::rtc_node_message::Message,
) -> &'static str {
    use router_proto::internal::rtc_node_message::Message;
    match message {
        Message::StartSession(_) => "start_session",
        Message::Request(_) => "request",
        Message::RemoveParticipant(_) => "remove_participant",
        Message::MuteTrack(_) => "mute_track",
        Message::UpdateParticipant(_) => "update_participant",
    }
}
