//! Configuration for the durable queue engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::validation::validate_table_name;
use crate::Result;

/// How the engine coordinates transactions around enqueue and delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionalMode {
    /// Enqueue joins the caller's transaction; delivery and acknowledgement
    /// share a single transaction per message.
    FullyTransactional,
    /// The engine opens its own transaction per operation. Default.
    SingleOperationTransaction,
    /// Delivery succeeds only once the handler explicitly acknowledges the
    /// message within `message_handling_timeout`.
    ManualAcknowledgement,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableQueuesConfig {
    /// Maximum duration a claimed message may stay in flight without being
    /// acknowledged or settled before it becomes claimable again.
    pub message_handling_timeout: Duration,
    /// Transaction coordination mode.
    pub transactional_mode: TransactionalMode,
    /// Name of the shared queue table in the backing database.
    pub shared_queue_table_name: String,
    /// Multiplicative factor applied to the polling interval after an empty
    /// poll. Must be greater than 1.
    pub polling_delay_increment_factor: f64,
    /// Ceiling for the stretched polling interval.
    pub max_polling_interval: Duration,
    /// Emit additional trace-level events for every queue operation.
    pub verbose_tracing: bool,
    /// How long `stop()` waits for in-flight handlers to finish.
    pub drain_timeout: Duration,
    /// Interval at which expired claims are swept back to the ready state.
    pub claim_sweep_interval: Duration,
}

/// Default name of the shared queue table.
pub const DEFAULT_QUEUE_TABLE_NAME: &str = "durable_queue_messages";

impl Default for DurableQueuesConfig {
    fn default() -> Self {
        Self {
            message_handling_timeout: Duration::from_secs(30),
            transactional_mode: TransactionalMode::SingleOperationTransaction,
            shared_queue_table_name: DEFAULT_QUEUE_TABLE_NAME.to_string(),
            polling_delay_increment_factor: 1.5,
            max_polling_interval: Duration::from_secs(2),
            verbose_tracing: false,
            drain_timeout: Duration::from_secs(30),
            claim_sweep_interval: Duration::from_secs(5),
        }
    }
}

impl DurableQueuesConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.shared_queue_table_name)?;

        if self.polling_delay_increment_factor <= 1.0 {
            return Err(crate::Error::Config(format!(
                "polling_delay_increment_factor must be greater than 1.0, got {}",
                self.polling_delay_increment_factor
            )));
        }
        if self.message_handling_timeout.is_zero() {
            return Err(crate::Error::Config(
                "message_handling_timeout must be non-zero".to_string(),
            ));
        }
        if self.max_polling_interval.is_zero() {
            return Err(crate::Error::Config(
                "max_polling_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DurableQueuesConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shared_queue_table_name, DEFAULT_QUEUE_TABLE_NAME);
        assert_eq!(
            config.transactional_mode,
            TransactionalMode::SingleOperationTransaction
        );
    }

    #[test]
    fn test_increment_factor_must_exceed_one() {
        let config = DurableQueuesConfig {
            polling_delay_increment_factor: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_table_name_is_validated() {
        let config = DurableQueuesConfig {
            shared_queue_table_name: "queue; DROP TABLE users".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let config = DurableQueuesConfig {
            message_handling_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
