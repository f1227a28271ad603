//! Validator configuration with TOML file support.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_consensus::{DEFAULT_MAX_STATUS_INTERVAL, DEFAULT_REVOLT_TIMEOUT};
use strata_crypto::{keypair_from_private, private_key_from_hex, public_key_from_hex};
use strata_types::{KeyPair, SignerSet};

use crate::{LogFormat, NodeError};

/// Configuration for one validator.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests). Every field has a default, but a
/// usable config needs at least `signers` and `private_key_hex`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Our position in `signers`.
    #[serde(default)]
    pub node_index: usize,

    /// Hex-encoded public keys of every signer, in consensus order.
    #[serde(default)]
    pub signers: Vec<String>,

    /// Hex-encoded Ed25519 secret key matching `signers[node_index]`.
    #[serde(default)]
    pub private_key_hex: String,

    /// Round loop cadence.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How long a height and round may stall before this node revolts.
    #[serde(default = "default_revolt_timeout_ms")]
    pub revolt_timeout_ms: u64,

    /// Upper bound between two status broadcasts.
    #[serde(default = "default_max_status_interval_ms")]
    pub max_status_interval_ms: u64,

    /// Period of the peer status dump in the log.
    #[serde(default = "default_status_log_interval_ms")]
    pub status_log_interval_ms: u64,

    /// First resend timeout for an unresolved intent.
    #[serde(default = "default_intent_base_timeout_ms")]
    pub intent_base_timeout_ms: u64,

    /// Multiplier applied to the resend timeout on every retry.
    #[serde(default = "default_intent_backoff_factor")]
    pub intent_backoff_factor: f64,

    /// Block database jobs that may wait behind the running one.
    #[serde(default = "default_db_queue_capacity")]
    pub db_queue_capacity: usize,

    /// How long shutdown waits for the block database worker.
    #[serde(default = "default_db_stop_timeout_ms")]
    pub db_stop_timeout_ms: u64,

    /// Largest peer message accepted, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Timing knobs of the round loop, derived from [`NodeConfig`].
#[derive(Clone, Debug, PartialEq)]
pub struct ConsensusParams {
    pub tick_interval: Duration,
    pub revolt_timeout: Duration,
    pub max_status_interval: Duration,
    pub status_log_interval: Duration,
    pub intent_base_timeout: Duration,
    pub intent_backoff_factor: f64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_tick_interval_ms() -> u64 {
    20
}

fn default_revolt_timeout_ms() -> u64 {
    DEFAULT_REVOLT_TIMEOUT.as_millis() as u64
}

fn default_max_status_interval_ms() -> u64 {
    DEFAULT_MAX_STATUS_INTERVAL.as_millis() as u64
}

fn default_status_log_interval_ms() -> u64 {
    10_000
}

fn default_intent_base_timeout_ms() -> u64 {
    1_000
}

fn default_intent_backoff_factor() -> f64 {
    1.1
}

fn default_db_queue_capacity() -> usize {
    64
}

fn default_db_stop_timeout_ms() -> u64 {
    1_000
}

fn default_max_message_size() -> u64 {
    strata_messages::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Check everything the worker needs before it starts.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.tick_interval_ms == 0 {
            return Err(NodeError::Config("tick_interval_ms must be positive".into()));
        }
        if self.intent_backoff_factor < 1.0 {
            return Err(NodeError::Config(
                "intent_backoff_factor must be at least 1.0".into(),
            ));
        }
        if self.db_queue_capacity == 0 {
            return Err(NodeError::Config("db_queue_capacity must be positive".into()));
        }
        self.log_format()?;
        self.keypair().map(|_| ())
    }

    pub fn signer_set(&self) -> Result<SignerSet, NodeError> {
        let keys = self
            .signers
            .iter()
            .map(|s| public_key_from_hex(s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| NodeError::Config(format!("signers: {e}")))?;
        let set = SignerSet::new(keys).map_err(|e| NodeError::Config(e.to_string()))?;
        set.check_index(self.node_index)
            .map_err(|e| NodeError::Config(format!("node_index: {e}")))?;
        Ok(set)
    }

    /// Our key pair. Must belong to the signer at `node_index`.
    pub fn keypair(&self) -> Result<KeyPair, NodeError> {
        let signers = self.signer_set()?;
        let private = private_key_from_hex(&self.private_key_hex)
            .map_err(|e| NodeError::Config(format!("private_key_hex: {e}")))?;
        let keypair = keypair_from_private(private);
        if signers.get(self.node_index) != Some(&keypair.public) {
            return Err(NodeError::Config(format!(
                "private key does not belong to signer {}",
                self.node_index
            )));
        }
        Ok(keypair)
    }

    pub fn log_format(&self) -> Result<LogFormat, NodeError> {
        match self.log_format.as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(NodeError::Config(format!("unknown log_format {other:?}"))),
        }
    }

    pub fn consensus_params(&self) -> ConsensusParams {
        ConsensusParams {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            revolt_timeout: Duration::from_millis(self.revolt_timeout_ms),
            max_status_interval: Duration::from_millis(self.max_status_interval_ms),
            status_log_interval: Duration::from_millis(self.status_log_interval_ms),
            intent_base_timeout: Duration::from_millis(self.intent_base_timeout_ms),
            intent_backoff_factor: self.intent_backoff_factor,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_index: 0,
            signers: Vec::new(),
            private_key_hex: String::new(),
            tick_interval_ms: default_tick_interval_ms(),
            revolt_timeout_ms: default_revolt_timeout_ms(),
            max_status_interval_ms: default_max_status_interval_ms(),
            status_log_interval_ms: default_status_log_interval_ms(),
            intent_base_timeout_ms: default_intent_base_timeout_ms(),
            intent_backoff_factor: default_intent_backoff_factor(),
            db_queue_capacity: default_db_queue_capacity(),
            db_stop_timeout_ms: default_db_stop_timeout_ms(),
            max_message_size: default_max_message_size(),
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}
