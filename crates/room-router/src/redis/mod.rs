//! Distributed routing over a shared Redis fabric.
//!
//! - [`keys`] - key and subject namespace
//! - [`lua_scripts`] - atomic directory operations
//! - [`store`] - registry + directory over the key-value namespace
//! - [`sink`] - publishing half of distributed pipes
//! - [`router`] - the [`RedisRouter`] realization

pub mod keys;
pub mod lua_scripts;
pub mod router;
pub mod sink;
pub mod store;

pub use router::RedisRouter;
pub use store::RedisStore;
