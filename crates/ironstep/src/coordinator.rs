//! Exactly-once step execution.

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{ConflictBackoff, TransactionConfig};
use crate::context::{self, TxHandle};
use crate::error::Error;
use crate::execution::ExecutionKey;
use crate::store::{LedgerTransaction, TxStore};

/// Run `step` at most once for `key`.
///
/// This function loops over:
/// 1. Looking up a committed output for `key` (returned without running `step`)
/// 2. Opening a transaction at the configured isolation level
/// 3. Running `step` with the transaction bound to the task
/// 4. Recording the serialized output in the same transaction
/// 5. Committing
///
/// If recording the output conflicts, another attempt for the same key got
/// there first: the transaction is rolled back and the loop starts over at
/// the lookup, which then returns the winner's output. There is no attempt
/// cap; a conflict means a peer made progress.
///
/// Errors from `step` roll back the transaction and are returned unchanged.
/// Any other error rolls back and is returned as `E::from(error)`.
///
/// When a transaction of this store is already bound to the task, `step` is
/// a nested call: it runs directly inside the outer transaction and its
/// output is covered by the outer step's record.
pub(crate) async fn invoke<S, F, Fut, R, E>(
    store: &S,
    key: &ExecutionKey,
    config: &TransactionConfig,
    backoff: Option<ConflictBackoff>,
    mut step: F,
) -> Result<R, E>
where
    S: TxStore,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: Serialize + DeserializeOwned,
    E: From<Error>,
{
    if context::is_active::<S::Transaction>() {
        debug!(
            workflow_id = %key.workflow_id(),
            function_num = key.function_num(),
            "Running nested step in the active transaction"
        );
        return step().await;
    }

    let mut conflicts = 0u32;
    loop {
        if let Some(record) = store.get_output(key).await? {
            debug!(
                workflow_id = %key.workflow_id(),
                function_num = key.function_num(),
                conflicts,
                "Returning recorded step output"
            );
            return Ok(record.decode()?);
        }

        let tx = store.begin(config.isolation_level).await?;
        let handle = TxHandle::new(key.clone(), tx);
        let result = handle.scope(step()).await;
        let mut tx = handle.release().await.ok_or(Error::MissingContext)?;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                rollback(tx, key).await;
                return Err(err);
            }
        };

        let payload = match serde_json::to_string(&output) {
            Ok(payload) => payload,
            Err(err) => {
                rollback(tx, key).await;
                return Err(Error::from(err).into());
            }
        };

        match tx.insert_output(key, &payload).await {
            Ok(()) => {
                tx.commit().await?;
                debug!(
                    workflow_id = %key.workflow_id(),
                    function_num = key.function_num(),
                    "Recorded step output"
                );
                return Ok(output);
            }
            Err(Error::Conflict(_)) => {
                rollback(tx, key).await;
                conflicts = conflicts.saturating_add(1);
                debug!(
                    workflow_id = %key.workflow_id(),
                    function_num = key.function_num(),
                    conflicts,
                    "Step output already recorded by a concurrent attempt, retrying"
                );
                match backoff {
                    Some(backoff) => {
                        tokio::time::sleep(backoff.delay_for_conflict(conflicts)).await;
                    }
                    None => tokio::task::yield_now().await,
                }
            }
            Err(err) => {
                rollback(tx, key).await;
                return Err(err.into());
            }
        }
    }
}

/// Best-effort rollback. A failed rollback leaves nothing committed: the store
/// discards the transaction when the connection goes away.
async fn rollback<T: LedgerTransaction>(tx: T, key: &ExecutionKey) {
    if let Err(err) = tx.rollback().await {
        warn!(
            workflow_id = %key.workflow_id(),
            function_num = key.function_num(),
            error = %err,
            "Rollback failed"
        );
    }
}
