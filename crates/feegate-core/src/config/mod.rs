//! Configuration parsing and management.
//!
//! The daemon reads a single TOML file. Every section except `[fee]` has
//! defaults, so a minimal file only names the settlement terms:
//!
//! ```toml
//! [fee]
//! asset = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
//! amount = "5000000"
//! destination = "0x000000000000000000000000000000000000fee5"
//! ```
//!
//! `amount` is a quoted base-10 integer in the asset's base unit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fee::{FeeAmount, FeeTerms};

/// Upper bound for every `*_secs` setting (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeegateConfig {
    /// Settlement terms stamped on every new record.
    pub fee: FeeSection,

    /// Fee store location.
    #[serde(default)]
    pub store: StoreConfig,

    /// Executor drivers.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Discovery, settlement and repair passes.
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Policy deactivation after payment.
    #[serde(default)]
    pub deactivator: DeactivatorConfig,

    /// Transaction oracle adapter.
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Signer sidecar.
    #[serde(default)]
    pub signer: SignerConfig,

    /// Health endpoint.
    #[serde(default)]
    pub health: HealthConfig,
}

impl FeegateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, a required key is missing or
    /// [`Self::validate`] rejects the values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fee.asset.trim().is_empty() {
            return Err(invalid("fee.asset must not be empty"));
        }
        if self.fee.destination.trim().is_empty() {
            return Err(invalid("fee.destination must not be empty"));
        }
        if self.fee.amount.is_zero() {
            return Err(invalid("fee.amount must be greater than zero"));
        }
        for (key, value) in [
            ("executor.poll_interval_secs", self.executor.poll_interval_secs),
            ("executor.call_timeout_secs", self.executor.call_timeout_secs),
            (
                "executor.execution_timeout_secs",
                self.executor.execution_timeout_secs,
            ),
            ("executor.lease_secs", self.executor.lease_secs),
            ("reconciler.interval_secs", self.reconciler.interval_secs),
            ("oracle.mark_lost_after_secs", self.oracle.mark_lost_after_secs),
            ("signer.request_timeout_secs", self.signer.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "{key} must be greater than zero"
                )));
            }
            if value > MAX_DURATION_SECS {
                return Err(ConfigError::Validation(format!(
                    "{key} must be at most {MAX_DURATION_SECS}"
                )));
            }
        }
        if self.executor.lease_secs < self.executor.execution_timeout_secs {
            return Err(invalid(
                "executor.lease_secs must be at least executor.execution_timeout_secs",
            ));
        }
        if self.executor.queue_capacity == 0 {
            return Err(invalid("executor.queue_capacity must be greater than zero"));
        }
        if !self.signer.base_url.starts_with("http://") {
            return Err(invalid("signer.base_url must be an http:// URL"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}

/// `[fee]`: settlement terms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FeeSection {
    /// Token contract of the settlement asset.
    pub asset: String,
    /// Fee in the asset's base unit.
    pub amount: FeeAmount,
    /// Treasury address.
    pub destination: String,
}

impl FeeSection {
    /// Terms for a record created now.
    #[must_use]
    pub fn terms(&self) -> FeeTerms {
        FeeTerms {
            asset: self.asset.clone(),
            amount: self.amount,
            destination: self.destination.clone(),
        }
    }
}

/// `[store]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// `SQLite` database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// `[executor]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Runs the polling pass and the queue consumer.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Polling pass period.
    #[serde(default = "default_executor_poll_interval")]
    pub poll_interval_secs: u64,

    /// Bound on each collaborator call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Bound on one queued execution.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    /// Lifetime of an execution claim.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// In-process queue depth.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl ExecutorConfig {
    /// Polling pass period.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Collaborator call bound.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Queued execution bound.
    #[must_use]
    pub const fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// Execution claim lifetime.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_executor_poll_interval(),
            call_timeout_secs: default_call_timeout(),
            execution_timeout_secs: default_execution_timeout(),
            lease_secs: default_lease_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// `[reconciler]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Runs the reconciler loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cycle period.
    #[serde(default = "default_reconciler_interval")]
    pub interval_secs: u64,

    /// Creates records for eligible scopes each cycle.
    #[serde(default = "default_true")]
    pub discovery: bool,

    /// Adopts stray broadcasts for pending records each cycle.
    #[serde(default = "default_true")]
    pub repair_pending: bool,
}

impl ReconcilerConfig {
    /// Cycle period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reconciler_interval(),
            discovery: true,
            repair_pending: true,
        }
    }
}

/// `[deactivator]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeactivatorConfig {
    /// Runs after each settlement pass.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Reason written to the policy.
    #[serde(default = "default_deactivation_reason")]
    pub reason: String,
}

impl Default for DeactivatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reason: default_deactivation_reason(),
        }
    }
}

/// `[oracle]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OracleConfig {
    /// Age after which an unconfirmed transaction is reported lost.
    #[serde(default = "default_mark_lost_after")]
    pub mark_lost_after_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            mark_lost_after_secs: default_mark_lost_after(),
        }
    }
}

/// `[signer]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SignerConfig {
    /// Sidecar base URL, e.g. `http://127.0.0.1:8645`.
    #[serde(default = "default_signer_url")]
    pub base_url: String,

    /// Per-request bound inside the HTTP client.
    #[serde(default = "default_signer_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            base_url: default_signer_url(),
            request_timeout_secs: default_signer_timeout(),
        }
    }
}

/// `[health]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Serves `GET /healthz`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address.
    #[serde(default = "default_health_bind")]
    pub bind: String,

    /// Listen port.
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_health_bind(),
            port: default_health_port(),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    PathBuf::from("feegate.db")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_executor_poll_interval() -> u64 {
    30
}

const fn default_call_timeout() -> u64 {
    30
}

const fn default_execution_timeout() -> u64 {
    300
}

const fn default_lease_secs() -> u64 {
    600
}

const fn default_queue_capacity() -> usize {
    1024
}

const fn default_reconciler_interval() -> u64 {
    15
}

fn default_deactivation_reason() -> String {
    "completed".to_string()
}

const fn default_mark_lost_after() -> u64 {
    3_600
}

fn default_signer_url() -> String {
    "http://127.0.0.1:8645".to_string()
}

const fn default_signer_timeout() -> u64 {
    20
}

fn default_health_bind() -> String {
    "127.0.0.1".to_string()
}

const fn default_health_port() -> u16 {
    8080
}

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [fee]
        asset = "0xusdc"
        amount = "100"
        destination = "0xtreasury"
    "#;

    #[test]
    fn test_parse_minimal_config() {
        let config = FeegateConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.fee.amount, FeeAmount::new(100));
        assert_eq!(config.store.path, PathBuf::from("feegate.db"));
        assert_eq!(config.executor.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.executor.execution_timeout(), Duration::from_secs(300));
        assert_eq!(config.reconciler.interval(), Duration::from_secs(15));
        assert_eq!(config.deactivator.reason, "completed");
        assert!(config.reconciler.discovery);
        assert!(config.health.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [fee]
            asset = "0xusdc"
            amount = "340282366920938463463374607431768211455"
            destination = "0xtreasury"

            [store]
            path = "/var/lib/feegate/fees.db"
            busy_timeout_ms = 250

            [executor]
            enabled = false
            poll_interval_secs = 5
            call_timeout_secs = 3
            execution_timeout_secs = 20
            lease_secs = 60
            queue_capacity = 16

            [reconciler]
            interval_secs = 7
            discovery = false

            [deactivator]
            reason = "listing fee settled"

            [oracle]
            mark_lost_after_secs = 900

            [signer]
            base_url = "http://signer.internal:9000"
            request_timeout_secs = 4

            [health]
            bind = "0.0.0.0"
            port = 9100
        "#;

        let config = FeegateConfig::from_toml(toml).unwrap();
        assert_eq!(config.fee.amount.base_units(), u128::MAX);
        assert_eq!(config.store.busy_timeout_ms, 250);
        assert!(!config.executor.enabled);
        assert_eq!(config.executor.lease(), Duration::from_secs(60));
        assert_eq!(config.executor.queue_capacity, 16);
        assert!(!config.reconciler.discovery);
        assert!(config.reconciler.repair_pending);
        assert_eq!(config.deactivator.reason, "listing fee settled");
        assert_eq!(config.oracle.mark_lost_after_secs, 900);
        assert_eq!(config.signer.base_url, "http://signer.internal:9000");
        assert_eq!(config.health.port, 9100);
    }

    #[test]
    fn test_missing_fee_section_is_rejected() {
        let err = FeegateConfig::from_toml("[store]\npath = \"x.db\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unquoted_amount_is_rejected() {
        let toml = MINIMAL.replace("\"100\"", "100");
        assert!(matches!(
            FeegateConfig::from_toml(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let toml = format!("{MINIMAL}\n[executor]\npoll_interval = 3\n");
        assert!(matches!(
            FeegateConfig::from_toml(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            (MINIMAL.replace("\"100\"", "\"0\""), "fee.amount"),
            (
                MINIMAL.replace("\"0xtreasury\"", "\"  \""),
                "fee.destination",
            ),
            (
                format!("{MINIMAL}\n[reconciler]\ninterval_secs = 0\n"),
                "reconciler.interval_secs",
            ),
            (
                format!("{MINIMAL}\n[executor]\nexecution_timeout_secs = 900\n"),
                "executor.lease_secs",
            ),
            (
                format!("{MINIMAL}\n[signer]\nbase_url = \"https://signer\"\n"),
                "signer.base_url",
            ),
            (
                format!("{MINIMAL}\n[executor]\nlease_secs = 99999999999\n"),
                "executor.lease_secs",
            ),
            (
                format!("{MINIMAL}\n[oracle]\nmark_lost_after_secs = 99999999999\n"),
                "oracle.mark_lost_after_secs",
            ),
        ];
        for (toml, key) in cases {
            match FeegateConfig::from_toml(&toml) {
                Err(ConfigError::Validation(msg)) => assert!(msg.contains(key), "{msg}"),
                other => panic!("expected validation error for {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = FeegateConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed = FeegateConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.fee, config.fee);
        assert_eq!(reparsed.executor, config.executor);
    }

    #[test]
    fn test_terms_copy_fee_section() {
        let config = FeegateConfig::from_toml(MINIMAL).unwrap();
        let terms = config.fee.terms();
        assert_eq!(terms.asset, "0xusdc");
        assert_eq!(terms.destination, "0xtreasury");
        assert_eq!(terms.amount, FeeAmount::new(100));
    }
}
