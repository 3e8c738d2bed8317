//! Moonlink Core: interpreter-independent building blocks
//!
//! Everything here is free of interpreter FFI so it can be tested on its own:
//!
//! - `error`: the shared error taxonomy (usage, marshaling, foreign)
//! - `encode`: the reusable NUL-terminated encode buffer
//! - `config`: environment configuration (builder + TOML)

pub mod config;
pub mod encode;
pub mod error;

pub use config::{DEFAULT_CHUNK_NAME, EnvironmentConfig};
pub use encode::{DEFAULT_ENCODE_BUFFER_SIZE, EncodeBuffer};
pub use error::{Error, Result, format_panic_payload};
