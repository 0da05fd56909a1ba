//! # Receiver Configuration
//!
//! Configuration for receivers and their pulling listener containers, loaded
//! from a YAML file with environment-specific overrides.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use frank_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let orders = manager.receiver_config("orders")?;
//! println!("orders polls with {} threads", orders.num_threads);
//! # Ok(())
//! # }
//! ```
//!
//! ## File layout
//!
//! ```yaml
//! receivers:
//!   orders:
//!     num_threads: 4
//!     transaction_attribute: required
//!     max_retries: 2
//! production:
//!   receivers:
//!     orders:
//!       num_threads: 16
//! ```

pub mod error;
pub mod loader;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::receiver::{
    DEFAULT_EXCEPTION_WARNING_THRESHOLD, DEFAULT_MAX_BACKOFF_DELAY_SECS,
    DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRIES_DELIVERY_COUNT_AWARE,
    DEFAULT_MAX_RETRY_INTERVAL_SECS, DEFAULT_PROCESS_RESULT_CACHE_SIZE,
};
use crate::transaction::Propagation;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring frank-config.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FrankConfig {
    /// Receivers keyed by name
    #[serde(default)]
    pub receivers: IndexMap<String, ReceiverConfig>,
}

impl FrankConfig {
    /// Validate every receiver and fill in names taken from the map keys
    pub fn validate(&mut self) -> ConfigResult<()> {
        for (name, receiver) in self.receivers.iter_mut() {
            if receiver.name.is_empty() {
                receiver.name = name.clone();
            }
            receiver.validate()?;
        }
        Ok(())
    }
}

/// What a receiver does after an unhandled exception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Log and keep receiving
    #[default]
    Continue,
    /// Move to ERROR, which stops the receiver until it is recovered
    Recover,
    /// Stop the receiver
    Close,
}

/// Which identifier the duplicate check looks up in the message log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateCheckMethod {
    #[default]
    MessageId,
    CorrelationId,
}

/// How matches of the hide expression are masked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HideMethod {
    /// Mask the whole match
    #[default]
    All,
    /// Mask the first half of the match only
    FirstHalf,
}

/// Message compaction applied before the message is logged and processed
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Element contents longer than this many characters are chomped
    pub chomp_char_size: Option<usize>,
    /// Element whose content is moved into a session key
    pub element_to_move: Option<String>,
    /// Session key receiving the moved content; defaults to the element name
    pub element_to_move_session_key: Option<String>,
    /// Semicolon separated element path; the innermost element is moved
    pub element_to_move_chain: Option<String>,
    /// Strip namespace prefixes when matching element names
    pub remove_compact_msg_namespaces: bool,
}

impl CompactionConfig {
    /// Whether any compaction is configured
    pub fn is_enabled(&self) -> bool {
        self.chomp_char_size.is_some()
            || self.element_to_move.is_some()
            || self.element_to_move_chain.is_some()
    }
}

/// Configuration of a single receiver and its poll loop
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub name: String,
    pub on_error: OnError,

    /// Maximum number of messages processed concurrently
    pub num_threads: usize,
    /// Maximum number of concurrent polls; only enforced when below `num_threads`
    pub num_threads_polling: usize,
    /// Seconds to wait between polls once the listener reported an empty source
    pub poll_interval_secs: u64,
    /// Peek for available messages before a transaction is started
    pub peek_untransacted: bool,

    pub transaction_attribute: Propagation,
    /// Transaction timeout in seconds; 0 disables the processing timeout
    pub transaction_timeout_secs: u64,

    /// Maximum retries per message; negative is unlimited, absent picks the listener default
    pub max_retries: Option<i32>,
    pub max_backoff_delay_secs: u64,
    /// Cap for the retrieval error backoff of the poll loop
    pub max_retry_interval_secs: u64,
    pub process_result_cache_size: usize,

    pub check_for_duplicates: bool,
    pub check_for_duplicates_method: DuplicateCheckMethod,

    /// JSON pointer into the payload selecting the business correlation id
    pub correlation_id_pointer: Option<String>,
    /// Regular expression whose first capture group is the business correlation id
    pub correlation_id_pattern: Option<String>,

    pub compaction: CompactionConfig,

    pub hide_regex: Option<String>,
    pub hide_method: HideMethod,

    /// Consecutive exceptions without a received message before the warning flag is raised
    pub exception_warning_threshold: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            on_error: OnError::Continue,
            num_threads: 1,
            num_threads_polling: 1,
            poll_interval_secs: 10,
            peek_untransacted: true,
            transaction_attribute: Propagation::Supports,
            transaction_timeout_secs: 0,
            max_retries: None,
            max_backoff_delay_secs: DEFAULT_MAX_BACKOFF_DELAY_SECS,
            max_retry_interval_secs: DEFAULT_MAX_RETRY_INTERVAL_SECS,
            process_result_cache_size: DEFAULT_PROCESS_RESULT_CACHE_SIZE,
            check_for_duplicates: false,
            check_for_duplicates_method: DuplicateCheckMethod::MessageId,
            correlation_id_pointer: None,
            correlation_id_pattern: None,
            compaction: CompactionConfig::default(),
            hide_regex: None,
            hide_method: HideMethod::All,
            exception_warning_threshold: DEFAULT_EXCEPTION_WARNING_THRESHOLD,
        }
    }
}

impl ReceiverConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validate values that cannot be expressed in the type system
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "name",
                "receiver configuration",
            ));
        }
        if self.num_threads == 0 {
            return Err(ConfigurationError::invalid_value(
                "num_threads",
                "0",
                format!("receiver '{}' needs at least one processing thread", self.name),
            ));
        }
        if self.num_threads_polling == 0 {
            return Err(ConfigurationError::invalid_value(
                "num_threads_polling",
                "0",
                format!("receiver '{}' needs at least one polling thread", self.name),
            ));
        }
        if self.process_result_cache_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "process_result_cache_size",
                "0",
                "the process status cache must hold at least one entry",
            ));
        }
        if self.max_backoff_delay_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_backoff_delay_secs",
                "0",
                "backoff delay must be at least one second",
            ));
        }
        if self.correlation_id_pointer.is_some() && self.correlation_id_pattern.is_some() {
            return Err(ConfigurationError::invalid_value(
                "correlation_id_pattern",
                self.correlation_id_pattern.clone().unwrap_or_default(),
                "cannot be combined with correlation_id_pointer",
            ));
        }
        if let Some(pointer) = &self.correlation_id_pointer {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(ConfigurationError::invalid_value(
                    "correlation_id_pointer",
                    pointer.clone(),
                    "a JSON pointer must start with '/'",
                ));
            }
        }
        for (field, pattern) in [
            ("correlation_id_pattern", &self.correlation_id_pattern),
            ("hide_regex", &self.hide_regex),
        ] {
            if let Some(pattern) = pattern {
                Regex::new(pattern).map_err(|e| {
                    ConfigurationError::invalid_value(field, pattern.clone(), e.to_string())
                })?;
            }
        }
        if self.compaction.element_to_move.is_some() && self.compaction.element_to_move_chain.is_some()
        {
            return Err(ConfigurationError::invalid_value(
                "compaction.element_to_move_chain",
                self.compaction
                    .element_to_move_chain
                    .clone()
                    .unwrap_or_default(),
                "cannot be combined with element_to_move",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        (self.transaction_timeout_secs > 0).then(|| Duration::from_secs(self.transaction_timeout_secs))
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval_secs.max(1))
    }

    /// Whether messages are processed inside a transaction
    pub fn is_transacted(&self) -> bool {
        self.transaction_attribute.is_transacted()
    }

    /// Whether polling concurrency is capped separately from processing concurrency
    pub fn has_poll_limit(&self) -> bool {
        self.num_threads_polling < self.num_threads
    }

    /// Maximum retries, defaulting by whether the listener counts deliveries itself
    pub fn effective_max_retries(&self, listener_counts_deliveries: bool) -> i32 {
        self.max_retries.unwrap_or(if listener_counts_deliveries {
            DEFAULT_MAX_RETRIES_DELIVERY_COUNT_AWARE
        } else {
            DEFAULT_MAX_RETRIES
        })
    }

    /// Backoff cap, kept below half the transaction timeout so the wait itself
    /// cannot time out the next attempt
    pub fn effective_max_backoff_delay(&self) -> Duration {
        let configured = self.max_backoff_delay_secs;
        let capped = if self.transaction_timeout_secs > 0 {
            configured.min(self.transaction_timeout_secs / 2)
        } else {
            configured
        };
        Duration::from_secs(capped.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReceiverConfig::named("orders");
        assert!(config.validate().is_ok());
        assert_eq!(config.on_error, OnError::Continue);
        assert!(!config.is_transacted());
        assert!(!config.has_poll_limit());
        assert_eq!(config.effective_max_retries(false), 1);
        assert_eq!(config.effective_max_retries(true), 3);
        assert_eq!(config.effective_max_backoff_delay(), Duration::from_secs(60));
        assert_eq!(config.transaction_timeout(), None);
    }

    #[test]
    fn test_backoff_capped_by_transaction_timeout() {
        let config = ReceiverConfig {
            transaction_timeout_secs: 30,
            ..ReceiverConfig::named("orders")
        };
        assert_eq!(config.effective_max_backoff_delay(), Duration::from_secs(15));

        let tiny = ReceiverConfig {
            transaction_timeout_secs: 1,
            ..ReceiverConfig::named("orders")
        };
        assert_eq!(tiny.effective_max_backoff_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let no_threads = ReceiverConfig {
            num_threads: 0,
            ..ReceiverConfig::named("orders")
        };
        assert!(matches!(
            no_threads.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));

        let bad_regex = ReceiverConfig {
            hide_regex: Some("([a-z".to_string()),
            ..ReceiverConfig::named("orders")
        };
        assert!(bad_regex.validate().is_err());

        let both_extractors = ReceiverConfig {
            correlation_id_pointer: Some("/id".to_string()),
            correlation_id_pattern: Some("id=(\\w+)".to_string()),
            ..ReceiverConfig::named("orders")
        };
        assert!(both_extractors.validate().is_err());

        let unnamed = ReceiverConfig::default();
        assert!(matches!(
            unnamed.validate(),
            Err(ConfigurationError::MissingRequiredField { .. })
        ));
    }

    #[test]
    fn test_yaml_deserialization_uses_defaults() {
        let yaml = r#"
receivers:
  orders:
    num_threads: 4
    num_threads_polling: 2
    transaction_attribute: required
    on_error: recover
"#;
        let mut config: FrankConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let orders = &config.receivers["orders"];
        assert_eq!(orders.name, "orders");
        assert_eq!(orders.num_threads, 4);
        assert!(orders.has_poll_limit());
        assert!(orders.is_transacted());
        assert_eq!(orders.on_error, OnError::Recover);
        assert_eq!(orders.poll_interval_secs, 10);
        assert_eq!(orders.exception_warning_threshold, 5);
    }
}
