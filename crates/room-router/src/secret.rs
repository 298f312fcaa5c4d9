//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. `SecretString` implements `Debug`
//! with redaction, so any struct that derives `Debug` around one cannot leak
//! the value through `{:?}` or tracing fields; access requires an explicit
//! `expose_secret()` call. Used here for the Redis connection URL, which may
//! embed credentials (`redis://:password@host:port`).

pub use secrecy::{ExposeSecret, SecretString};
