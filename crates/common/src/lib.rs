//! Common types and utilities for the henyey bucket engine.
//!
//! This crate provides the primitives shared by the bucket crate and by
//! whatever application embeds it:
//!
//! - [`Hash256`]: the SHA-256 digest used to name buckets
//! - [`protocol`]: ledger protocol constants and version gates
//! - [`xdr_stream`]: record-marked XDR framing used by bucket files
//! - [`fs_utils`]: crash-safe rename helpers
//! - [`config`]: TOML configuration for bucket storage and logging
//! - [`logging`]: global `tracing` subscriber setup

pub mod config;
pub mod error;
pub mod fs_utils;
pub mod logging;
pub mod protocol;
pub mod types;
pub mod xdr_stream;

pub use config::{BucketConfig, Config, LogFormat, LogLevel, LoggingConfig};
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;

/// Re-export stellar-xdr for convenience
pub use stellar_xdr;
