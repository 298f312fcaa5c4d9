//! Routing layer error types.
//!
//! Every failure surfaced by the layer maps onto one of six kinds so callers
//! can branch on [`ErrorKind`] without matching variant payloads. Transient
//! fabric and store errors propagate; the layer never silently retries a
//! publish.

use thiserror::Error;

/// Error type for all routing operations.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Room unassigned or node unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// A set-if-absent write lost the race; read back for the winner.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No live node, fabric unreachable, or backing store down.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Operation against a torn-down pipe.
    #[error("pipe closed")]
    Closed,

    /// Deadline elapsed or the operation was cancelled.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Malformed or out-of-state message.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Kind classification of a [`RouterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unavailable,
    Closed,
    Canceled,
    Protocol,
}

impl RouterError {
    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::NotFound(_) => ErrorKind::NotFound,
            RouterError::Conflict(_) => ErrorKind::Conflict,
            RouterError::Unavailable(_) => ErrorKind::Unavailable,
            RouterError::Closed => ErrorKind::Closed,
            RouterError::Canceled(_) => ErrorKind::Canceled,
            RouterError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether this error is the distinct not-found kind, which
    /// `start_participant_signal` uses to decide to assign a room.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, RouterError::NotFound(_))
    }
}

impl From<redis::RedisError> for RouterError {
    fn from(err: redis::RedisError) -> Self {
        RouterError::Unavailable(format!("redis: {err}"))
    }
}

impl From<prost::DecodeError> for RouterError {
    fn from(err: prost::DecodeError) -> Self {
        RouterError::Protocol(format!("malformed payload: {err}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            RouterError::NotFound("roomA".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            RouterError::Conflict("lost race".to_string()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            RouterError::Unavailable("store down".to_string()).kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(RouterError::Closed.kind(), ErrorKind::Closed);
        assert_eq!(
            RouterError::Canceled("deadline".to_string()).kind(),
            ErrorKind::Canceled
        );
        assert_eq!(
            RouterError::Protocol("bad frame".to_string()).kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_is_not_found() {
        assert!(RouterError::NotFound("room".to_string()).is_not_found());
        assert!(!RouterError::Closed.is_not_found());
        assert!(!RouterError::Unavailable("x".to_string()).is_not_found());
    }

    #[test]
    fn test_decode_error_maps_to_protocol() {
        use prost::Message;
        // A truncated varint is not a valid message.
        let err = router_proto::internal::RtcNodeMessage::decode(&[0x0a_u8, 0xff][..])
            .expect_err("truncated payload should fail to decode");
        let routed: RouterError = err.into();
        assert_eq!(routed.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", RouterError::NotFound("roomA".to_string())),
            "not found: roomA"
        );
        assert_eq!(format!("{}", RouterError::Closed), "pipe closed");
    }
}
