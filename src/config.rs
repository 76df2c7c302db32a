//! In-process client configuration.
//!
//! Parsing torrc files or CLI flags is an external collaborator's job; this
//! module owns the validated value they populate (§6) plus the defaults used
//! when a field is left unset.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TorError};

/// Minimum and maximum accepted `HandshakeTimeout`, per §6.
pub const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(TorError::ConfigInvalid(format!("unknown LogLevel {other:?}"))),
        }
    }
}

/// Validated client configuration (§6 option table).
#[derive(Debug, Clone)]
pub struct TorConfig {
    pub socks_port: u16,
    pub control_port: Option<u16>,
    pub data_directory: PathBuf,
    pub log_level: LogLevel,
    pub circuit_pool_min_size: usize,
    pub circuit_pool_max_size: usize,
    pub enable_circuit_prebuilding: bool,
    pub circuit_build_timeout: Duration,
    pub num_guards: usize,
    pub max_circuit_age: Duration,
    pub handshake_timeout: Duration,
    pub directory_mirrors: Vec<String>,
}

impl Default for TorConfig {
    fn default() -> Self {
        TorConfig {
            socks_port: 9050,
            control_port: None,
            data_directory: PathBuf::from("./tor-data"),
            log_level: LogLevel::Info,
            circuit_pool_min_size: 2,
            circuit_pool_max_size: 10,
            enable_circuit_prebuilding: true,
            circuit_build_timeout: Duration::from_secs(60),
            num_guards: 2,
            max_circuit_age: Duration::from_secs(10 * 60),
            handshake_timeout: Duration::from_secs(30),
            directory_mirrors: Vec::new(),
        }
    }
}

impl TorConfig {
    /// Validate option ranges, matching §6's `ConfigInvalid` contract exactly:
    /// callers get one specific, actionable error per offending field rather
    /// than a generic "bad config" message.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_pool_min_size == 0 {
            return Err(TorError::ConfigInvalid(
                "CircuitPoolMinSize must be at least 1".into(),
            ));
        }
        if self.circuit_pool_min_size > self.circuit_pool_max_size {
            return Err(TorError::ConfigInvalid(
                "CircuitPoolMinSize must not exceed CircuitPoolMaxSize".into(),
            ));
        }
        if !(1..=3).contains(&self.num_guards) {
            return Err(TorError::ConfigInvalid(
                "NumGuards must be between 1 and 3".into(),
            ));
        }
        if self.handshake_timeout < MIN_HANDSHAKE_TIMEOUT
            || self.handshake_timeout > MAX_HANDSHAKE_TIMEOUT
        {
            return Err(TorError::ConfigInvalid(format!(
                "HandshakeTimeout must be within [{:?}, {:?}]",
                MIN_HANDSHAKE_TIMEOUT, MAX_HANDSHAKE_TIMEOUT
            )));
        }
        if self.socks_port == 0 && self.control_port.is_none() {
            return Err(TorError::ConfigInvalid(
                "at least one of SocksPort/ControlPort must be enabled".into(),
            ));
        }
        Ok(())
    }
}
