//! Utilities shared by the SQL drivers.
//!
//! - [`dialect`]: statement building per engine
//! - [`tls`]: TLS configuration from `ssl_mode`

pub mod dialect;
pub mod tls;

pub use dialect::{natural_key_index_name, Dialect};
