//! Exactly-once transactional steps for durable workflows.
//!
//! A durable workflow engine re-runs workflow code after crashes and retries.
//! Ironstep makes the database work inside such code safe to re-run:
//!
//! - **Output ledger**: every step's result is recorded in the same
//!   transaction as the step's own writes, keyed by `(workflow_id, function_num)`
//! - **Idempotent replay**: a step whose output is recorded returns it
//!   without running again
//! - **Race convergence**: concurrent attempts of one step settle on the
//!   primary key: exactly one commits, the rest return its output
//! - **Ambient transaction**: code below a step reaches the step's
//!   transaction through [`DataSource::client`] instead of a parameter
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     DataSource<S>::run_tx_step                          │
//! │                                                                         │
//! │   1. Look up the recorded output (hit → return it)                      │
//! │   2. Begin a transaction at the configured isolation level              │
//! │   3. Run the step with the transaction bound to the task                │
//! │   4. Insert the output into the ledger (conflict → rollback, go to 1)   │
//! │   5. Commit                                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ironstep::{Error, IsolationLevel, PgDataSource, PgStore, TransactionConfig, WorkflowContext};
//!
//! let source = Arc::new(PgDataSource::new("app-db", PgStore::new(pool)));
//! source.initialize().await?;
//!
//! let reserve = source.register(
//!     "reserve_seat",
//!     TransactionConfig::with_isolation(IsolationLevel::Serializable),
//!     |seat: i32| async move {
//!         let handle = PgDataSource::client()?;
//!         let mut tx = handle.lock().await?;
//!         sqlx::query("UPDATE seats SET taken = true WHERE id = $1")
//!             .bind(seat)
//!             .execute(&mut **tx)
//!             .await
//!             .map_err(Error::from)?;
//!         Ok::<_, Error>(seat)
//!     },
//! );
//!
//! // The engine binds the workflow; re-running this after a crash returns
//! // the recorded seat without updating it twice.
//! WorkflowContext::new("wf-1").scope(reserve.call(12)).await?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: Enables [`PgStore`] and [`PgDataSource`] (on by default)

mod config;
pub mod context;
mod coordinator;
mod data_source;
mod error;
pub mod execution;
mod isolation;
pub mod store;

pub use config::{ConflictBackoff, DataSourceConfig, TransactionConfig};
pub use context::{TxGuard, TxHandle};
#[cfg(feature = "postgres")]
pub use data_source::PgDataSource;
pub use data_source::{DataSource, TxStep};
pub use error::{Error, Result};
pub use execution::{ExecutionKey, WorkflowContext, WorkflowId};
pub use isolation::IsolationLevel;
#[cfg(feature = "postgres")]
pub use store::{PgStore, PgTransaction};
pub use store::{LedgerTransaction, MemoryStore, MemoryTx, OutputRecord, TxStore};
