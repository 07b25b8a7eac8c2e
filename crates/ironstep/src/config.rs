//! Data source and step configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::isolation::IsolationLevel;

/// Per-step transaction options.
///
/// # Example
///
/// ```
/// use ironstep::{IsolationLevel, TransactionConfig};
///
/// let config = TransactionConfig::with_isolation(IsolationLevel::Serializable);
/// assert_eq!(config.isolation_level, Some(IsolationLevel::Serializable));
/// assert_eq!(TransactionConfig::default().isolation_level, None);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Isolation level for the step's transaction.
    ///
    /// `None` runs at the store's default level.
    #[serde(default)]
    pub isolation_level: Option<IsolationLevel>,
}

impl TransactionConfig {
    pub fn with_isolation(isolation_level: IsolationLevel) -> Self {
        Self {
            isolation_level: Some(isolation_level),
        }
    }
}

/// Delay between conflict retries.
///
/// A conflict means another attempt for the same step committed (or is about
/// to commit) its output, so the retry always converges. The backoff only
/// spaces out re-checks while that peer finishes. There is no attempt cap.
///
/// The delay before retry N is: `min(base_delay * 2^(N-1), max_delay)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictBackoff {
    /// Delay before the first retry. Doubles with each further conflict.
    pub base_delay: Duration,

    /// Upper bound for the delay.
    pub max_delay: Duration,
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl ConflictBackoff {
    /// Delay to wait after the `conflicts`-th conflict (1-based).
    pub fn delay_for_conflict(&self, conflicts: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(conflicts.saturating_sub(1));
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

/// Configuration for a data source.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ironstep::{ConflictBackoff, DataSourceConfig};
///
/// let config = DataSourceConfig {
///     max_connections: 20,
///     conflict_backoff: Some(ConflictBackoff::default()),
///     ..Default::default()
/// };
/// assert_eq!(config.acquire_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    /// Maximum number of pooled connections.
    ///
    /// Each in-flight step holds one connection for its whole transaction.
    /// Default: 10.
    pub max_connections: u32,

    /// How long a step waits for a pooled connection before failing.
    ///
    /// Default: 30 seconds.
    pub acquire_timeout: Duration,

    /// Delay between conflict retries.
    ///
    /// `None` retries immediately. Default: `None`.
    pub conflict_backoff: Option<ConflictBackoff>,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            conflict_backoff: None,
        }
    }
}
