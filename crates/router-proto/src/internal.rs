//! Node records and node-to-node routing envelopes.
//!
//! Two envelopes travel on the fabric:
//!
//! - [`RtcNodeMessage`] flows toward the RTC node that owns a room, on the
//!   room's subject. It is demultiplexed by `participant_key`.
//! - [`SignalNodeMessage`] flows back toward the signal node terminating a
//!   participant connection, on the connection's subject.

use serde::{Deserialize, Serialize};

/// A member of the fleet, persisted in the node registry and rewritten on
/// every heartbeat.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier for this process instance.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Address other nodes can reach this node on.
    #[prost(string, tag = "2")]
    pub ip: String,
    #[prost(uint32, tag = "3")]
    pub num_cpus: u32,
    #[prost(message, optional, tag = "4")]
    pub stats: Option<NodeStats>,
}

/// Load and liveness information embedded in a [`Node`] record.
///
/// `updated_at` is the authoritative heartbeat: readers judge liveness by
/// `now - updated_at`, never by store-level TTLs.
#[derive(Clone, Copy, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct NodeStats {
    /// When the node process started (Unix seconds).
    #[prost(int64, tag = "1")]
    pub started_at: i64,
    /// When the node last reported its status (Unix seconds).
    #[prost(int64, tag = "2")]
    pub updated_at: i64,
    #[prost(uint32, tag = "3")]
    pub num_rooms: u32,
    #[prost(uint32, tag = "4")]
    pub num_clients: u32,
    #[prost(uint32, tag = "5")]
    pub num_tracks_in: u32,
    #[prost(uint32, tag = "6")]
    pub num_tracks_out: u32,
}

/// Permissions granted to a participant for the lifetime of its session.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ParticipantPermission {
    #[prost(bool, tag = "1")]
    pub can_subscribe: bool,
    #[prost(bool, tag = "2")]
    pub can_publish: bool,
    #[prost(bool, tag = "3")]
    pub can_publish_data: bool,
}

/// Envelope for messages addressed to a room's RTC owner.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RtcNodeMessage {
    /// `room_name + '|' + identity`; addresses the session pipe on the RTC
    /// side. See [`crate::participant_key`].
    #[prost(string, tag = "1")]
    pub participant_key: String,
    #[prost(oneof = "rtc_node_message::Message", tags = "2, 3, 4, 5, 6")]
    pub message: Option<rtc_node_message::Message>,
}

pub mod rtc_node_message {
    /// Message kinds carried by [`super::RtcNodeMessage`].
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        /// Open a new session pipe for a participant connection.
        #[prost(message, tag = "2")]
        StartSession(super::StartSession),
        /// A signal request forwarded over an established pipe.
        #[prost(message, tag = "3")]
        Request(super::SignalRequest),
        /// Remove a participant from the room.
        #[prost(message, tag = "4")]
        RemoveParticipant(super::RemoveParticipant),
        /// Mute or unmute one of a participant's tracks.
        #[prost(message, tag = "5")]
        MuteTrack(super::MuteTrack),
        /// Update a participant's metadata or permissions.
        #[prost(message, tag = "6")]
        UpdateParticipant(super::UpdateParticipant),
    }
}

/// Envelope for messages addressed to a participant connection's signal node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalNodeMessage {
    /// Connection this message belongs to; names the signal-side subject.
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(oneof = "signal_node_message::Message", tags = "2, 3")]
    pub message: Option<signal_node_message::Message>,
}

pub mod signal_node_message {
    /// Message kinds carried by [`super::SignalNodeMessage`].
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        /// A signal response forwarded over an established pipe.
        #[prost(message, tag = "2")]
        Response(super::SignalResponse),
        /// The RTC side has closed the session.
        #[prost(message, tag = "3")]
        EndSession(super::EndSession),
    }
}

/// First message of the pipe establishment protocol, published by the signal
/// node on the room subject.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartSession {
    #[prost(string, tag = "1")]
    pub room_name: String,
    #[prost(string, tag = "2")]
    pub identity: String,
    /// Fresh random identifier minted by the signal node; the RTC node
    /// publishes responses on the subject this id names.
    #[prost(string, tag = "3")]
    pub connection_id: String,
    /// Whether the client is reconnecting (resume instead of restart).
    #[prost(bool, tag = "4")]
    pub reconnect: bool,
    /// Opaque metadata to pass through to the participant.
    #[prost(string, tag = "5")]
    pub metadata: String,
    #[prost(message, optional, tag = "6")]
    pub permission: Option<ParticipantPermission>,
    #[prost(int32, tag = "7")]
    pub protocol_version: i32,
    #[prost(bool, tag = "8")]
    pub auto_subscribe: bool,
    #[prost(bool, tag = "9")]
    pub hidden: bool,
}

/// Close marker for the RTC-to-signal direction of a session pipe.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct EndSession {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveParticipant {
    #[prost(string, tag = "1")]
    pub identity: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MuteTrack {
    #[prost(string, tag = "1")]
    pub identity: String,
    #[prost(string, tag = "2")]
    pub track_sid: String,
    #[prost(bool, tag = "3")]
    pub muted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateParticipant {
    #[prost(string, tag = "1")]
    pub identity: String,
    #[prost(string, tag = "2")]
    pub metadata: String,
    #[prost(message, optional, tag = "3")]
    pub permission: Option<ParticipantPermission>,
}

/// Control message sent from the signal side over a session pipe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalRequest {
    #[prost(oneof = "signal_request::Message", tags = "1, 2, 3, 4")]
    pub message: Option<signal_request::Message>,
}

pub mod signal_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Offer(super::SessionDescription),
        #[prost(message, tag = "2")]
        Answer(super::SessionDescription),
        #[prost(message, tag = "3")]
        Trickle(super::TrickleRequest),
        #[prost(message, tag = "4")]
        Leave(super::LeaveRequest),
    }
}

/// Control message sent from the RTC side over a session pipe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalResponse {
    #[prost(oneof = "signal_response::Message", tags = "1, 2, 3, 4")]
    pub message: Option<signal_response::Message>,
}

pub mod signal_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Answer(super::SessionDescription),
        #[prost(message, tag = "2")]
        Offer(super::SessionDescription),
        #[prost(message, tag = "3")]
        Trickle(super::TrickleRequest),
        #[prost(message, tag = "4")]
        Leave(super::LeaveRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionDescription {
    /// "offer" or "answer".
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub sdp: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrickleRequest {
    /// JSON-serialized ICE candidate init.
    #[prost(string, tag = "1")]
    pub candidate_init: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct LeaveRequest {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use prost::Message;

    fn sample_start_session() -> StartSession {
        StartSession {
            room_name: "roomA".to_string(),
            identity: "alice".to_string(),
            connection_id: "cn-1234".to_string(),
            reconnect: false,
            metadata: "{\"seat\":3}".to_string(),
            permission: Some(ParticipantPermission {
                can_subscribe: true,
                can_publish: true,
                can_publish_data: false,
            }),
            protocol_version: 1,
            auto_subscribe: true,
            hidden: false,
        }
    }

    #[test]
    fn test_rtc_node_message_start_session_round_trip() {
        let msg = RtcNodeMessage {
            participant_key: crate::participant_key("roomA", "alice"),
            message: Some(rtc_node_message::Message::StartSession(
                sample_start_session(),
            )),
        };

        let bytes = msg.encode_to_vec();
        let decoded = RtcNodeMessage::decode(bytes.as_slice()).unwrap();

        assert_eq!(decoded.participant_key, "roomA|alice");
        match decoded.message {
            Some(rtc_node_message::Message::StartSession(ss)) => {
                assert_eq!(ss.room_name, "roomA");
                assert_eq!(ss.connection_id, "cn-1234");
                assert!(ss.auto_subscribe);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_signal_node_message_end_session_round_trip() {
        let msg = SignalNodeMessage {
            connection_id: "cn-1234".to_string(),
            message: Some(signal_node_message::Message::EndSession(EndSession {})),
        };

        let bytes = msg.encode_to_vec();
        let decoded = SignalNodeMessage::decode(bytes.as_slice()).unwrap();

        assert_eq!(decoded.connection_id, "cn-1234");
        assert!(matches!(
            decoded.message,
            Some(signal_node_message::Message::EndSession(_))
        ));
    }

    #[test]
    fn test_signal_request_offer_round_trip() {
        let req = SignalRequest {
            message: Some(signal_request::Message::Offer(SessionDescription {
                r#type: "offer".to_string(),
                sdp: "v=0...".to_string(),
            })),
        };

        let decoded = SignalRequest::decode(req.encode_to_vec().as_slice()).unwrap();
        match decoded.message {
            Some(signal_request::Message::Offer(sdp)) => assert_eq!(sdp.sdp, "v=0..."),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unset_oneof_decodes_as_none() {
        let msg = RtcNodeMessage {
            participant_key: "roomA|alice".to_string(),
            message: None,
        };
        let decoded = RtcNodeMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert!(decoded.message.is_none());
    }

    #[test]
    fn test_node_json_round_trip() {
        let node = Node {
            id: "nd-host-1".to_string(),
            ip: "10.0.0.5".to_string(),
            num_cpus: 8,
            stats: Some(NodeStats {
                started_at: 1_706_000_000,
                updated_at: 1_706_000_030,
                num_rooms: 2,
                num_clients: 17,
                num_tracks_in: 20,
                num_tracks_out: 60,
            }),
        };

        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"id\":\"nd-host-1\""));
        assert!(json.contains("\"updated_at\":1706000030"));

        let parsed: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_node_protobuf_round_trip() {
        let node = Node {
            id: "nd-host-1".to_string(),
            ip: "10.0.0.5".to_string(),
            num_cpus: 8,
            stats: Some(NodeStats::default()),
        };
        let decoded = Node::decode(node.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, node);
    }
}
