//! Engine configuration
//!
//! Timeouts, block sizes and security material are passed explicitly to the
//! engine constructor. Configuration can be loaded from TOML:
//!
//! ```toml
//! dialect = "auto"
//!
//! [timeouts]
//! response_ms = 5000
//! erase_ms = 30000
//! operation_ms = 300000
//!
//! [program]
//! block_size = 1024
//! retry_count = 3
//! retry_base_delay_ms = 100
//! verify_after_write = true
//! verify_prefix_bytes = 4096
//!
//! [security]
//! level = 1
//! secret = "a55a"
//!
//! [security.manufacturer_secrets]
//! acme = "0102030405"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ProgramError, ProgramResult};
use crate::protocol::DialectPreference;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub program: ProgramConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Command dialect selection; `auto` derives it from the ECU protocols
    #[serde(default)]
    pub dialect: DialectPreference,
    #[serde(default)]
    pub uds: UdsConfig,
}

impl EngineConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.block_size == 0 {
            return Err(ConfigError::Invalid(
                "program.block_size must be greater than zero".to_string(),
            ));
        }
        if self.security.level == 0 || self.security.level > 0x3F {
            return Err(ConfigError::Invalid(format!(
                "security.level must be within 1..=63, got {}",
                self.security.level
            )));
        }
        if let Some(secret) = &self.security.secret {
            decode_secret("security.secret", secret)?;
        }
        for (manufacturer, secret) in &self.security.manufacturer_secrets {
            decode_secret(&format!("security.manufacturer_secrets.{}", manufacturer), secret)?;
        }
        Ok(())
    }

    /// Default options for programming operations
    pub fn program_options(&self) -> ProgramOptions {
        ProgramOptions {
            block_size: self.program.block_size,
            retry_count: self.program.retry_count,
            verify_after_write: self.program.verify_after_write,
            verify_mode: if self.program.verify_full {
                VerifyMode::Full
            } else {
                VerifyMode::Prefix(self.program.verify_prefix_bytes)
            },
        }
    }
}

pub(crate) fn decode_secret(field: &str, secret: &str) -> Result<Vec<u8>, ConfigError> {
    let bytes = hex::decode(secret.trim())
        .map_err(|e| ConfigError::Invalid(format!("{} is not valid hex: {}", field, e)))?;
    if bytes.is_empty() {
        return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
    }
    Ok(bytes)
}

/// Exchange and operation deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Wait for a single response frame
    #[serde(default = "default_response_timeout")]
    pub response_ms: u64,
    /// Erase and other slow steps, also bounds response-pending waits
    #[serde(default = "default_erase_timeout")]
    pub erase_ms: u64,
    /// Whole operation deadline
    #[serde(default = "default_operation_timeout")]
    pub operation_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            response_ms: default_response_timeout(),
            erase_ms: default_erase_timeout(),
            operation_ms: default_operation_timeout(),
        }
    }
}

impl TimeoutsConfig {
    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }

    pub fn erase(&self) -> Duration {
        Duration::from_millis(self.erase_ms)
    }

    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }
}

fn default_response_timeout() -> u64 {
    5_000
}

fn default_erase_timeout() -> u64 {
    30_000
}

fn default_operation_timeout() -> u64 {
    300_000 // 5 minutes
}

/// Defaults for block transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Additional attempts per block after the first failure
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Delay before retry N is `retry_base_delay_ms * N`
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_true")]
    pub verify_after_write: bool,
    /// Read back the whole image instead of a prefix
    #[serde(default)]
    pub verify_full: bool,
    #[serde(default = "default_verify_prefix")]
    pub verify_prefix_bytes: u32,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            retry_count: default_retry_count(),
            retry_base_delay_ms: default_retry_base_delay(),
            verify_after_write: default_true(),
            verify_full: false,
            verify_prefix_bytes: default_verify_prefix(),
        }
    }
}

impl ProgramConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

fn default_block_size() -> u32 {
    1024
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_verify_prefix() -> u32 {
    4096
}

/// Security access material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Seed/key access level (seed sub-function is `2 * level - 1`)
    #[serde(default = "default_security_level")]
    pub level: u8,
    /// Hex secret for the default XOR key derivation and challenge check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Per-manufacturer hex secrets, keyed case-insensitively
    #[serde(default)]
    pub manufacturer_secrets: HashMap<String, String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: default_security_level(),
            secret: None,
            manufacturer_secrets: HashMap::new(),
        }
    }
}

fn default_security_level() -> u8 {
    1
}

/// UDS / KWP2000 dialect parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdsConfig {
    /// Override the programming session byte (UDS 0x02, KWP2000 0x85)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub programming_session: Option<u8>,
    /// Erase-memory routine identifier (RoutineControl 0x31)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erase_routine: Option<u16>,
    /// Check-programming-dependencies routine identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_routine: Option<u16>,
    /// Data identifier that returns the memory layout record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_did: Option<u16>,
}

/// How much of the image is read back after programming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// First `n` bytes
    Prefix(u32),
    Full,
}

impl VerifyMode {
    /// Number of bytes to compare for an image of `len` bytes
    pub fn limit(&self, len: usize) -> usize {
        match self {
            VerifyMode::Prefix(n) => len.min(*n as usize),
            VerifyMode::Full => len,
        }
    }
}

/// Options for one programming operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramOptions {
    pub block_size: u32,
    pub retry_count: u32,
    pub verify_after_write: bool,
    pub verify_mode: VerifyMode,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        EngineConfig::default().program_options()
    }
}

impl ProgramOptions {
    pub fn validate(&self) -> ProgramResult<()> {
        if self.block_size == 0 {
            return Err(ProgramError::Validation(
                "block_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
