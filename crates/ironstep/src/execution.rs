//! Execution identity supplied by the workflow engine.
//!
//! The engine owns workflow ids and step numbering. It exposes them to
//! ironstep through two task-local bindings:
//!
//! - [`WorkflowContext::scope`] binds the running workflow; the data source
//!   allocates the next function number from it for each transactional step.
//! - [`with_key`] binds one step's [`ExecutionKey`] directly, for engines that
//!   number steps themselves and call
//!   [`DataSource::invoke_transaction_function`](crate::DataSource::invoke_transaction_function).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};

tokio::task_local! {
    static WORKFLOW: Arc<WorkflowContext>;
    static STEP: ExecutionKey;
}

/// Identifier of one workflow run, assigned by the engine.
///
/// It is the first half of every [`ExecutionKey`] and is stored verbatim in
/// the ledger's `workflow_id` column. An engine that recovers a run must hand
/// back the same id, or the recorded outputs won't be found.
///
/// ```
/// use ironstep::WorkflowId;
///
/// let id = WorkflowId::from("wf-1");
/// assert_eq!(id.as_str(), "wf-1");
/// assert!(WorkflowId::from("").is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// The id as stored in the ledger.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the empty id, which no engine hands out. Keys
    /// carrying it are rejected as a missing execution identity.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkflowId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkflowId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Identity of one step within one workflow run.
///
/// This is the ledger's primary key: at most one output is ever recorded per
/// key.
///
/// ```
/// use ironstep::ExecutionKey;
///
/// let key = ExecutionKey::new("wf-1", 3);
/// assert_eq!(key.function_num(), 3);
/// assert_eq!(key.to_string(), "wf-1:3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionKey {
    workflow_id: WorkflowId,
    function_num: i32,
}

impl ExecutionKey {
    /// Create a key from a workflow id and function number.
    pub fn new(workflow_id: impl Into<WorkflowId>, function_num: i32) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            function_num,
        }
    }

    /// The workflow this step belongs to.
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// The step's position within the workflow.
    pub fn function_num(&self) -> i32 {
        self.function_num
    }

    /// Reject identities the engine should never hand out.
    fn validate(self) -> Result<Self> {
        if self.workflow_id.is_empty() {
            return Err(Error::MissingExecutionIdentity("workflow id is empty"));
        }
        if self.function_num < 0 {
            return Err(Error::MissingExecutionIdentity("function number is negative"));
        }
        Ok(self)
    }
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.workflow_id, self.function_num)
    }
}

/// A running workflow, as seen by its transactional steps.
///
/// Function numbers are handed out in call order starting at the resume
/// point. Replaying a workflow from the start with the same step order
/// yields the same keys, which is what lets recorded outputs be found again.
#[derive(Debug)]
pub struct WorkflowContext {
    workflow_id: WorkflowId,
    next_function_num: AtomicI32,
}

impl WorkflowContext {
    /// Context for a fresh run, numbering steps from 0.
    pub fn new(workflow_id: impl Into<WorkflowId>) -> Arc<Self> {
        Self::resume_at(workflow_id, 0)
    }

    /// Context that continues numbering at `next_function_num`.
    pub fn resume_at(workflow_id: impl Into<WorkflowId>, next_function_num: i32) -> Arc<Self> {
        Arc::new(Self {
            workflow_id: workflow_id.into(),
            next_function_num: AtomicI32::new(next_function_num),
        })
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Allocate the key for the next step.
    pub fn next_key(&self) -> ExecutionKey {
        let function_num = self.next_function_num.fetch_add(1, Ordering::SeqCst);
        ExecutionKey::new(self.workflow_id.clone(), function_num)
    }

    /// Run `fut` with this workflow bound to the current task.
    pub async fn scope<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        WORKFLOW.scope(self, fut).await
    }

    /// The workflow bound to the current task, if any.
    pub fn current() -> Option<Arc<Self>> {
        WORKFLOW.try_with(Arc::clone).ok()
    }
}

/// Run `fut` with `key` bound as the current step identity.
pub async fn with_key<F: Future>(key: ExecutionKey, fut: F) -> F::Output {
    STEP.scope(key, fut).await
}

/// The step identity bound to the current task.
///
/// Fails with [`Error::MissingExecutionIdentity`] when no step is bound, or
/// when the bound identity has an empty workflow id or a negative function
/// number.
pub fn current_key() -> Result<ExecutionKey> {
    STEP.try_with(Clone::clone)
        .map_err(|_| Error::MissingExecutionIdentity("no step is bound to the current task"))?
        .validate()
}

/// Key for a step called through the data source.
///
/// Allocates the next function number when a workflow is bound, and falls
/// back to the step identity bound with [`with_key`] otherwise.
pub(crate) fn allocate_key() -> Result<ExecutionKey> {
    match WorkflowContext::current() {
        Some(workflow) => workflow.next_key().validate(),
        None => current_key(),
    }
}
