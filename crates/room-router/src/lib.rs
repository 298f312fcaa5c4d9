//! Cross-node participant routing for a real-time room server fleet.
//!
//! Many nodes collectively host sessions. Each participant connection has a
//! *signal* end (the node terminating the client's control connection) and
//! an *RTC* end (the node owning the room's media plane), generally on
//! different machines. This crate:
//!
//! - decides which node hosts the RTC side of each room (first-writer-wins),
//! - establishes an ordered, bidirectional, per-connection message pipe
//!   between the two ends,
//! - delivers room-addressed control messages to the current RTC owner,
//! - maintains a live catalog of fleet members and evicts dead ones.
//!
//! # Architecture
//!
//! ```text
//! Router (trait)
//! ├── LocalRouter  - single process; pipes are in-memory channels
//! └── RedisRouter  - fleet mode; pipes ride pub/sub subjects
//!     ├── rtc.{room}           requests + control, consumed by the owner
//!     └── signal.{connection}  responses + EndSession, consumed by the
//!                              signal node
//! ```
//!
//! Both realizations share the registry/directory contracts ([`store`]),
//! the placement strategy ([`selector`]), and the sink/source pipe
//! machinery ([`channel`]).
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = RouterConfig::from_env()?;
//! let selector = Box::new(RandomSelector::new(config.expire_after));
//! let router = create_router(config, selector).await?;
//! router.on_new_participant(Arc::new(|room, init, requests, responses| {
//!     // hand off to the media engine on its own task
//! }));
//! router.on_rtc_message(Arc::new(|room, identity, message| { /* ... */ }));
//! router.start().await?;
//! ```

pub mod channel;
pub mod config;
pub mod errors;
pub mod local;
pub mod node;
mod observability;
pub mod redis;
pub mod router;
pub mod secret;
pub mod selector;
pub mod store;

pub use channel::{MessageSink, MessageSource};
pub use config::RouterConfig;
pub use errors::{ErrorKind, RouterError};
pub use local::LocalRouter;
pub use redis::RedisRouter;
pub use router::{
    create_router, NewParticipantCallback, ParticipantInit, Router, RtcMessageCallback,
    SignalConnection,
};
pub use selector::{NodeSelector, RandomSelector};
