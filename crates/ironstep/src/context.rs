//! Ambient access to the active step's transaction.
//!
//! While a transactional step runs, its transaction is bound to the running
//! task. Code anywhere below the step function (helpers, repositories, nested
//! steps) reaches it with [`current`] instead of taking it as a parameter.
//!
//! ```ignore
//! async fn record_step(step: i32) -> ironstep::Result<i32> {
//!     let handle = PgDataSource::client()?;
//!     let mut tx = handle.lock().await?;
//!     let step = sqlx::query_scalar("SELECT $1::int")
//!         .bind(step)
//!         .fetch_one(&mut **tx)
//!         .await?;
//!     Ok(step)
//! }
//! ```
//!
//! The binding is task-local: concurrently running steps never see each
//! other's transactions, and tasks spawned from inside a step don't inherit
//! it. When the step finishes the coordinator takes the transaction back to
//! commit or roll it back; any handle clone still around afterwards fails
//! with [`Error::MissingContext`].

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::execution::ExecutionKey;

tokio::task_local! {
    static ACTIVE: ActiveScope;
}

struct ActiveScope {
    key: ExecutionKey,
    slot: Arc<dyn Any + Send + Sync>,
}

/// Exclusive access to the active transaction.
///
/// Dereferences to the store's transaction type. Drop it before calling into
/// a nested step, which locks the same transaction.
pub type TxGuard<T> = OwnedMappedMutexGuard<Option<T>, T>;

/// Shared reference to the transaction of one step attempt.
pub struct TxHandle<T> {
    key: ExecutionKey,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for TxHandle<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for TxHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle").field("key", &self.key).finish()
    }
}

impl<T: Send + 'static> TxHandle<T> {
    pub(crate) fn new(key: ExecutionKey, tx: T) -> Self {
        Self {
            key,
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// The step this transaction belongs to.
    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    /// Lock the transaction for use.
    ///
    /// Fails with [`Error::MissingContext`] once the owning step has
    /// released the transaction.
    pub async fn lock(&self) -> Result<TxGuard<T>> {
        let guard = Arc::clone(&self.slot).lock_owned().await;
        OwnedMutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| Error::MissingContext)
    }

    /// Returns `true` if both handles refer to the same transaction.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Run `fut` with this handle bound as the active transaction.
    pub(crate) async fn scope<F: Future>(&self, fut: F) -> F::Output {
        let scope = ActiveScope {
            key: self.key.clone(),
            slot: Arc::clone(&self.slot) as Arc<dyn Any + Send + Sync>,
        };
        ACTIVE.scope(scope, fut).await
    }

    /// Take the transaction back, invalidating every outstanding handle.
    pub(crate) async fn release(&self) -> Option<T> {
        self.slot.lock().await.take()
    }
}

/// The active transaction of the step running on this task.
///
/// Fails with [`Error::MissingContext`] outside a step, or when the active
/// step belongs to a store with a different transaction type.
pub fn current<T: Send + 'static>() -> Result<TxHandle<T>> {
    ACTIVE
        .try_with(|scope| {
            let slot = Arc::clone(&scope.slot)
                .downcast::<Mutex<Option<T>>>()
                .ok()?;
            Some(TxHandle {
                key: scope.key.clone(),
                slot,
            })
        })
        .ok()
        .flatten()
        .ok_or(Error::MissingContext)
}

/// Returns `true` while a step with transaction type `T` is running on this
/// task.
pub fn is_active<T: Send + 'static>() -> bool {
    current::<T>().is_ok()
}
