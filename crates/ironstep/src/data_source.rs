//! Data sources: the entry point for running transactional steps.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{DataSourceConfig, TransactionConfig};
use crate::context::{self, TxHandle};
use crate::coordinator;
use crate::error::{Error, Result};
use crate::execution;
use crate::store::TxStore;

#[cfg(feature = "postgres")]
use crate::store::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Ready,
    Destroyed,
}

impl Lifecycle {
    fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Created => "not initialized",
            Lifecycle::Ready => "ready",
            Lifecycle::Destroyed => "destroyed",
        }
    }
}

/// A transactional data source registered with the workflow engine.
///
/// Runs step functions exactly once per execution identity: each step runs
/// in a transaction of the underlying store, and its output is recorded in
/// that same transaction. Replays of the step return the recorded output
/// without running the function again.
///
/// # Lifecycle
///
/// A data source starts out unusable. [`initialize`](Self::initialize) makes
/// it ready, [`destroy`](Self::destroy) releases the store for good. Both are
/// idempotent. Invoking a step outside the ready state fails with
/// [`Error::Unavailable`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use ironstep::{DataSource, Error, MemoryStore, TransactionConfig, WorkflowContext};
///
/// let source = Arc::new(DataSource::new("app-db", MemoryStore::new()));
/// source.initialize().await?;
///
/// let double = source.register("double", TransactionConfig::default(), |x: i64| async move {
///     Ok::<_, Error>(x * 2)
/// });
///
/// let value = WorkflowContext::new("wf-1").scope(double.call(5)).await?;
/// assert_eq!(value, 10);
/// ```
pub struct DataSource<S: TxStore> {
    name: String,
    store: S,
    config: DataSourceConfig,
    state: RwLock<Lifecycle>,
}

impl<S: TxStore> std::fmt::Debug for DataSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("ds_type", &S::KIND)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: TxStore> DataSource<S> {
    /// Create a data source with default configuration.
    pub fn new(name: impl Into<String>, store: S) -> Self {
        Self::with_config(name, store, DataSourceConfig::default())
    }

    pub fn with_config(name: impl Into<String>, store: S, config: DataSourceConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            state: RwLock::new(Lifecycle::Created),
        }
    }

    /// The name the data source was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store driver, e.g. `"postgres"`.
    pub fn ds_type(&self) -> &'static str {
        S::KIND
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// Prepare the store for serving steps.
    ///
    /// Calling it again once ready is a no-op. Fails with
    /// [`Error::Unavailable`] after [`destroy`](Self::destroy).
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            Lifecycle::Ready => return Ok(()),
            Lifecycle::Destroyed => return Err(self.unavailable(Lifecycle::Destroyed)),
            Lifecycle::Created => {}
        }

        self.store.initialize().await?;
        *state = Lifecycle::Ready;

        info!(data_source = %self.name, ds_type = S::KIND, "Data source initialized");
        Ok(())
    }

    /// Release the store. Calling it again is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == Lifecycle::Destroyed {
            return Ok(());
        }

        self.store.destroy().await?;
        *state = Lifecycle::Destroyed;

        info!(data_source = %self.name, ds_type = S::KIND, "Data source destroyed");
        Ok(())
    }

    /// Run `step` exactly once for the execution bound to the current task.
    ///
    /// This is the engine's entry point. The execution identity is read from
    /// [`execution::with_key`]; without one the call fails with
    /// [`Error::MissingExecutionIdentity`] before touching the store.
    ///
    /// `step` may be called more than once when concurrent attempts race for
    /// the same execution, but at most one call's output is ever committed,
    /// and every racer returns that output.
    pub async fn invoke_transaction_function<F, Fut, R, E>(
        &self,
        config: &TransactionConfig,
        step: F,
    ) -> std::result::Result<R, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        R: Serialize + DeserializeOwned,
        E: From<Error>,
    {
        let key = execution::current_key()?;
        self.ensure_ready().await?;

        coordinator::invoke(
            &self.store,
            &key,
            config,
            self.config.conflict_backoff,
            step,
        )
        .await
    }

    /// Run `step` as the next transactional step of the bound workflow.
    ///
    /// Allocates the step's function number from the
    /// [`WorkflowContext`](crate::WorkflowContext) bound to the task (or
    /// uses the key bound with [`execution::with_key`]) and runs it through
    /// [`invoke_transaction_function`](Self::invoke_transaction_function).
    ///
    /// Called from inside another step of this store type, `step` runs in the
    /// active transaction and no function number is allocated, so a replay
    /// numbers the outer steps the same way.
    pub async fn run_tx_step<F, Fut, R, E>(
        &self,
        name: &str,
        config: &TransactionConfig,
        mut step: F,
    ) -> std::result::Result<R, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        R: Serialize + DeserializeOwned,
        E: From<Error>,
    {
        if context::is_active::<S::Transaction>() {
            debug!(step = name, "Running nested step in the active transaction");
            return step().await;
        }

        let key = execution::allocate_key()?;
        debug!(
            step = name,
            workflow_id = %key.workflow_id(),
            function_num = key.function_num(),
            "Running transactional step"
        );
        execution::with_key(key, self.invoke_transaction_function(config, step)).await
    }

    /// Wrap `f` as a named transactional step of this data source.
    ///
    /// Registration does no I/O. Each [`TxStep::call`] allocates the next
    /// execution identity of the bound workflow at call time.
    pub fn register<F>(
        self: &Arc<Self>,
        name: impl Into<String>,
        config: TransactionConfig,
        f: F,
    ) -> TxStep<S, F> {
        TxStep {
            source: Arc::clone(self),
            name: name.into(),
            config,
            f,
        }
    }

    /// The transaction of the step running on this task.
    ///
    /// Fails with [`Error::MissingContext`] outside a step of this store type.
    pub fn client() -> Result<TxHandle<S::Transaction>> {
        context::current::<S::Transaction>()
    }

    async fn ensure_ready(&self) -> Result<()> {
        match *self.state.read().await {
            Lifecycle::Ready => Ok(()),
            state => Err(self.unavailable(state)),
        }
    }

    fn unavailable(&self, state: Lifecycle) -> Error {
        Error::Unavailable {
            name: self.name.clone(),
            state: state.as_str(),
        }
    }
}

/// A PostgreSQL-backed data source.
#[cfg(feature = "postgres")]
pub type PgDataSource = DataSource<PgStore>;

#[cfg(feature = "postgres")]
impl DataSource<PgStore> {
    /// Create a data source whose pool connects on first use.
    pub fn connect_lazy(
        name: impl Into<String>,
        options: sqlx::postgres::PgConnectOptions,
        config: DataSourceConfig,
    ) -> Self {
        let store = PgStore::connect_lazy(options, &config);
        Self::with_config(name, store, config)
    }

    /// Create database `name` if it doesn't exist. See [`PgStore::ensure_database`].
    pub async fn ensure_database(
        options: &sqlx::postgres::PgConnectOptions,
        name: &str,
    ) -> Result<bool> {
        PgStore::ensure_database(options, name).await
    }

    /// Create the ledger schema. See [`PgStore::configure_schema`].
    pub async fn configure_schema(options: &sqlx::postgres::PgConnectOptions) -> Result<()> {
        PgStore::configure_schema(options).await
    }
}

/// A step function registered with a [`DataSource`].
pub struct TxStep<S: TxStore, F> {
    source: Arc<DataSource<S>>,
    name: String,
    config: TransactionConfig,
    f: F,
}

impl<S: TxStore, F> std::fmt::Debug for TxStep<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxStep")
            .field("name", &self.name)
            .field("data_source", &self.source.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: TxStore, F> TxStep<S, F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Run the step with `args` as the next step of the bound workflow.
    ///
    /// `args` is cloned for each run of the function, since a lost race
    /// runs it again.
    pub async fn call<A, Fut, R, E>(&self, args: A) -> std::result::Result<R, E>
    where
        F: Fn(A) -> Fut,
        A: Clone,
        Fut: Future<Output = std::result::Result<R, E>>,
        R: Serialize + DeserializeOwned,
        E: From<Error>,
    {
        self.source
            .run_tx_step(&self.name, &self.config, || (self.f)(args.clone()))
            .await
    }
}
