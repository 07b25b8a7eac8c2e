//! Storage abstraction for the output ledger and step transactions.
//!
//! This module provides the [`TxStore`] and [`LedgerTransaction`] traits that
//! abstract over different storage backends. Two implementations are provided:
//!
//! - [`PgStore`]: PostgreSQL storage for production (requires `postgres` feature)
//! - [`MemoryStore`]: In-process storage for tests and embedding

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

use serde::de::DeserializeOwned;
use time::OffsetDateTime;

pub use memory::{MemoryStore, MemoryTx};
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgTransaction};

use crate::error::Result;
use crate::execution::ExecutionKey;
use crate::isolation::IsolationLevel;

/// Committed output of one step execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub key: ExecutionKey,
    /// The step's return value as JSON text. `NULL` rows decode as JSON `null`.
    pub output: Option<String>,
    pub created_at: OffsetDateTime,
}

impl OutputRecord {
    /// Deserialize the recorded return value.
    pub fn decode<R: DeserializeOwned>(&self) -> Result<R> {
        let value = match &self.output {
            Some(text) => serde_json::from_str(text)?,
            None => serde_json::from_value(serde_json::Value::Null)?,
        };
        Ok(value)
    }
}

/// Storage backend for step outputs and the transactions steps run in.
///
/// Users typically don't interact with this trait directly; use
/// [`DataSource`](crate::DataSource) which drives the full
/// check-execute-persist cycle.
///
/// # Implementations
///
/// - [`PgStore`]: PostgreSQL with a primary key on the ledger (requires `postgres` feature)
/// - [`MemoryStore`]: in-process maps guarded by a mutex
pub trait TxStore: Send + Sync + 'static {
    /// The transaction type handed to step functions.
    type Transaction: LedgerTransaction;

    /// Short driver name, reported by [`DataSource::ds_type`](crate::DataSource::ds_type).
    const KIND: &'static str;

    /// Acquire whatever the store needs before serving steps.
    ///
    /// Must be idempotent.
    fn initialize(&self) -> impl Future<Output = Result<()>> + Send;

    /// Release the store's resources. Must be idempotent.
    fn destroy(&self) -> impl Future<Output = Result<()>> + Send;

    /// Look up the committed output for `key`.
    ///
    /// Reads committed state only, outside any step transaction.
    fn get_output(
        &self,
        key: &ExecutionKey,
    ) -> impl Future<Output = Result<Option<OutputRecord>>> + Send;

    /// Open a transaction at `isolation_level`, or at the store default when
    /// `None`.
    fn begin(
        &self,
        isolation_level: Option<IsolationLevel>,
    ) -> impl Future<Output = Result<Self::Transaction>> + Send;
}

/// A transaction a step runs in.
///
/// Nothing is persisted until [`commit`](Self::commit). Dropping the
/// transaction without committing rolls it back.
pub trait LedgerTransaction: Send + 'static {
    /// Record `output` as the result of `key` within this transaction.
    ///
    /// Fails with [`Error::Conflict`](crate::Error::Conflict) when an output
    /// for `key` already exists.
    fn insert_output(
        &mut self,
        key: &ExecutionKey,
        output: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Commit all changes made in this transaction.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discard all changes made in this transaction.
    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}
