//! Environment configuration
//!
//! Configuration is built in code with the builder methods, or loaded from a
//! TOML document whose keys mirror the field names:
//!
//! ```toml
//! open_libs = true
//! encode_buffer_size = 65536
//! collection_hook = true
//! traceback = false
//! chunk_name = "=chunk"
//! ```
//!
//! Missing keys keep their defaults.

use crate::encode::DEFAULT_ENCODE_BUFFER_SIZE;
use crate::error::{Error, Result};
use serde::Deserialize;

/// Chunk name used when a caller does not supply one
pub const DEFAULT_CHUNK_NAME: &str = "=chunk";

/// Settings applied when an environment is created
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Open the interpreter's standard libraries
    pub open_libs: bool,

    /// Size of the reusable buffer for NUL-terminated names
    pub encode_buffer_size: usize,

    /// Plant a sentinel object so that each foreign collection cycle sweeps
    /// the intern table. Without it, reclamation only happens through an
    /// explicit sweep.
    pub collection_hook: bool,

    /// Append a foreign stack traceback to runtime error messages
    pub traceback: bool,

    /// Chunk name for `eval`/`load` calls that do not name their chunk
    pub chunk_name: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig {
            open_libs: true,
            encode_buffer_size: DEFAULT_ENCODE_BUFFER_SIZE,
            collection_hook: true,
            traceback: false,
            chunk_name: DEFAULT_CHUNK_NAME.to_string(),
        }
    }
}

impl EnvironmentConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        EnvironmentConfig::default()
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EnvironmentConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse environment config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no environment can be built from
    pub fn validate(&self) -> Result<()> {
        if self.encode_buffer_size == 0 {
            return Err(Error::Config(
                "encode_buffer_size must be at least 1 byte".to_string(),
            ));
        }
        if self.chunk_name.contains('\0') {
            return Err(Error::Config(
                "chunk_name must not contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_open_libs(mut self, open: bool) -> Self {
        self.open_libs = open;
        self
    }

    pub fn with_encode_buffer_size(mut self, size: usize) -> Self {
        self.encode_buffer_size = size.max(1);
        self
    }

    pub fn with_collection_hook(mut self, enabled: bool) -> Self {
        self.collection_hook = enabled;
        self
    }

    pub fn with_traceback(mut self, enabled: bool) -> Self {
        self.traceback = enabled;
        self
    }

    pub fn with_chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }
}
