//! Backend configuration.
//!
//! Settings are plain data and can be read from TOML:
//!
//! ```toml
//! opt_level = "speed"
//! verify = true
//! log_metrics = false
//! ```

use serde::Deserialize;

use super::types::{JitError, JitResult};

/// Cranelift optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// Value of Cranelift's `opt_level` setting
    pub fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Options for [`CodegenBackend`](super::backend::CodegenBackend)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub opt_level: OptLevel,

    /// Run the Cranelift IR verifier on every function
    pub verify: bool,

    /// Log timing and size metrics at `info` for every emitted module and loaded unit
    pub log_metrics: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            opt_level: OptLevel::Speed,
            verify: cfg!(debug_assertions),
            log_metrics: false,
        }
    }
}

impl BackendConfig {
    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_log_metrics(mut self, log_metrics: bool) -> Self {
        self.log_metrics = log_metrics;
        self
    }

    /// Parse a configuration from TOML; absent keys keep their defaults
    pub fn from_toml_str(content: &str) -> JitResult<Self> {
        toml::from_str(content).map_err(|e| JitError::Config(e.to_string()))
    }
}
