//! In-process store implementation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use time::OffsetDateTime;

use super::{LedgerTransaction, OutputRecord, TxStore};
use crate::error::{Error, Result};
use crate::execution::ExecutionKey;
use crate::isolation::IsolationLevel;

/// Number of BEGIN statements kept for [`MemoryStore::begin_statements`].
const BEGIN_LOG_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Shared {
    outputs: HashMap<ExecutionKey, OutputRecord>,
    /// Keys inserted by a transaction that has not committed yet.
    reserved: HashSet<ExecutionKey>,
    values: HashMap<String, Value>,
    /// The most recent BEGIN statements, oldest first.
    begin_statements: VecDeque<String>,
}

/// In-process store for tests and embedding.
///
/// Mirrors the guarantees of [`PgStore`](super::PgStore) without a database:
///
/// - the ledger accepts one output per key; a second insert for a key that is
///   committed, or inserted by a transaction still in flight, conflicts
/// - a [`MemoryTx`] stages key/value writes and the ledger insert, and
///   applies them together on commit
/// - dropping a [`MemoryTx`] discards its writes and frees its ledger key
///
/// Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value stored under `name`.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.lock().values.get(name).cloned()
    }

    /// Number of committed ledger rows.
    pub fn output_count(&self) -> usize {
        self.lock().outputs.len()
    }

    /// The BEGIN statements of the most recently opened transactions, oldest
    /// first. Only the last 256 are kept.
    pub fn begin_statements(&self) -> Vec<String> {
        self.lock().begin_statements.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TxStore for MemoryStore {
    type Transaction = MemoryTx;

    const KIND: &'static str = "memory";

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn get_output(&self, key: &ExecutionKey) -> Result<Option<OutputRecord>> {
        Ok(self.lock().outputs.get(key).cloned())
    }

    async fn begin(&self, isolation_level: Option<IsolationLevel>) -> Result<MemoryTx> {
        let mut shared = self.lock();
        if shared.begin_statements.len() == BEGIN_LOG_CAPACITY {
            shared.begin_statements.pop_front();
        }
        shared
            .begin_statements
            .push_back(IsolationLevel::begin_statement(isolation_level));
        drop(shared);

        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            writes: HashMap::new(),
            record: None,
        })
    }
}

/// Transaction of a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTx {
    shared: Arc<Mutex<Shared>>,
    writes: HashMap<String, Value>,
    record: Option<OutputRecord>,
}

impl MemoryTx {
    /// Stage a write of `value` under `name`.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.writes.insert(name.into(), value);
    }

    /// Read `name`, seeing this transaction's own staged writes.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.writes.get(name) {
            Some(value) => Some(value.clone()),
            None => lock_shared(&self.shared).values.get(name).cloned(),
        }
    }
}

impl LedgerTransaction for MemoryTx {
    async fn insert_output(&mut self, key: &ExecutionKey, output: &str) -> Result<()> {
        if self.record.is_some() {
            return Err(Error::Conflict(key.clone()));
        }

        let mut shared = lock_shared(&self.shared);
        if shared.outputs.contains_key(key) || !shared.reserved.insert(key.clone()) {
            return Err(Error::Conflict(key.clone()));
        }

        self.record = Some(OutputRecord {
            key: key.clone(),
            output: Some(output.to_owned()),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        let record = self.record.take();

        let mut shared = lock_shared(&self.shared);
        shared.values.extend(writes);
        if let Some(record) = record {
            shared.reserved.remove(&record.key);
            shared.outputs.insert(record.key.clone(), record);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            lock_shared(&self.shared).reserved.remove(&record.key);
        }
    }
}
