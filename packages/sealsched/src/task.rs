use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::SchedError;
use crate::sector::SectorRef;
use crate::selector::WorkerSelector;
use crate::worker::WorkerRpc;

/// Stages of the sector sealing pipeline that can be dispatched to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    AddPiece,
    PreCommit1,
    PreCommit2,
    Commit1,
    Commit2,
    Fetch,
    Finalize,
    Unseal,
    ReadPiece,
    ReplicaUpdate,
}

impl TaskType {
    pub const ALL: [TaskType; 10] = [
        TaskType::AddPiece,
        TaskType::PreCommit1,
        TaskType::PreCommit2,
        TaskType::Commit1,
        TaskType::Commit2,
        TaskType::Fetch,
        TaskType::Finalize,
        TaskType::Unseal,
        TaskType::ReadPiece,
        TaskType::ReplicaUpdate,
    ];

    /// Static scheduling priority. Higher runs first; ties are FIFO.
    /// Late-pipeline stages outrank early ones so sectors drain before
    /// new work is admitted.
    pub fn priority(&self) -> u8 {
        match self {
            TaskType::Finalize => 9,
            TaskType::Fetch => 8,
            TaskType::ReadPiece => 7,
            TaskType::Unseal => 6,
            TaskType::Commit1 => 5,
            TaskType::Commit2 => 4,
            TaskType::PreCommit2 => 3,
            TaskType::ReplicaUpdate => 2,
            TaskType::PreCommit1 => 1,
            TaskType::AddPiece => 0,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::AddPiece => "seal/v0/addpiece",
            TaskType::PreCommit1 => "seal/v0/precommit/1",
            TaskType::PreCommit2 => "seal/v0/precommit/2",
            TaskType::Commit1 => "seal/v0/commit/1",
            TaskType::Commit2 => "seal/v0/commit/2",
            TaskType::Fetch => "seal/v0/fetch",
            TaskType::Finalize => "seal/v0/finalize",
            TaskType::Unseal => "seal/v0/unseal",
            TaskType::ReadPiece => "seal/v0/read",
            TaskType::ReplicaUpdate => "seal/v0/replicaupdate",
        };
        write!(f, "{}", s)
    }
}

/// Cooperative cancellation for one task, shared by the caller's handle,
/// the scheduler and the task's closures.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { inner: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.inner.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.borrow()
    }

    /// Resolves once the task has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

/// One phase of a task, run against the worker that won the scheduling
/// match. Both phases receive the task's cancel token; long-running closures
/// are expected to observe it and bail out, and the scheduler additionally
/// races it around every phase.
pub type WorkerAction = Box<
    dyn FnOnce(CancelToken, Arc<dyn WorkerRpc>) -> BoxFuture<'static, Result<(), SchedError>>
        + Send,
>;

/// Box a plain async closure into a [`WorkerAction`].
pub fn action<F, Fut>(f: F) -> WorkerAction
where
    F: FnOnce(CancelToken, Arc<dyn WorkerRpc>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), SchedError>> + Send + 'static,
{
    Box::new(move |cancel, rpc| Box::pin(f(cancel, rpc)))
}

/// Everything a caller provides when submitting a task.
pub struct TaskSpec {
    pub sector: SectorRef,
    pub task_type: TaskType,
    /// Preferred execution group, if the caller wants one
    pub group: Option<String>,
    /// Remote Commit2: the worker delegates the proof to a foreign machine,
    /// so no local resources are reserved
    pub remote_c2: bool,
    pub selector: Arc<dyn WorkerSelector>,
    pub prepare: WorkerAction,
    pub work: WorkerAction,
}

/// A scheduled task as the dispatcher and worker loops see it.
pub struct TaskRequest {
    pub sector: SectorRef,
    pub task_type: TaskType,
    pub group: Option<String>,
    pub remote_c2: bool,
    pub start: DateTime<Utc>,
    pub(crate) seq: u64,
    pub(crate) selector: Arc<dyn WorkerSelector>,
    pub(crate) prepare: Mutex<Option<WorkerAction>>,
    pub(crate) work: Mutex<Option<WorkerAction>>,
    ret: Mutex<Option<oneshot::Sender<Result<(), SchedError>>>>,
    pub(crate) cancel: CancelToken,
    poke: mpsc::Sender<()>,
}

impl TaskRequest {
    pub(crate) fn new(
        spec: TaskSpec,
        seq: u64,
        poke: mpsc::Sender<()>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<(), SchedError>>) {
        let (ret_tx, ret_rx) = oneshot::channel();
        let request = Arc::new(Self {
            sector: spec.sector,
            task_type: spec.task_type,
            group: spec.group,
            remote_c2: spec.remote_c2,
            start: Utc::now(),
            seq,
            selector: spec.selector,
            prepare: Mutex::new(Some(spec.prepare)),
            work: Mutex::new(Some(spec.work)),
            ret: Mutex::new(Some(ret_tx)),
            cancel: CancelToken::new(),
            poke,
        });
        (request, ret_rx)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn take_prepare(&self) -> Option<WorkerAction> {
        self.prepare.lock().take()
    }

    pub(crate) fn take_work(&self) -> Option<WorkerAction> {
        self.work.lock().take()
    }

    /// Deliver the task's single result. Later calls are no-ops, so every
    /// exit path may call this without coordination.
    pub(crate) fn respond(&self, result: Result<(), SchedError>) {
        if let Some(tx) = self.ret.lock().take()
            && tx.send(result).is_err()
        {
            log::warn!(
                "task response dropped before delivery (sector {}, task {})",
                self.sector.id,
                self.task_type
            );
        }
    }
}

/// Caller-side handle for one submitted task.
pub struct TaskHandle {
    request: Arc<TaskRequest>,
    result: oneshot::Receiver<Result<(), SchedError>>,
}

impl TaskHandle {
    pub(crate) fn new(
        request: Arc<TaskRequest>,
        result: oneshot::Receiver<Result<(), SchedError>>,
    ) -> Self {
        Self { request, result }
    }

    /// Cancel the task. A task still in the schedule queue is dropped with
    /// [`SchedError::Cancelled`] on the next match pass; an in-flight task
    /// has its current phase raced against the token, and the closures
    /// themselves receive it to bail out cleanly.
    pub fn cancel(&self) {
        self.request.cancel.cancel();
        let _ = self.request.poke.try_send(());
    }

    /// The task's cancel token, for wiring into caller-side shutdown.
    pub fn token(&self) -> CancelToken {
        self.request.cancel.clone()
    }

    /// Wait for the task's single result.
    pub async fn wait(self) -> Result<(), SchedError> {
        match self.result.await {
            Ok(res) => res,
            Err(_) => Err(SchedError::SchedulerClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_pipeline_stages_outrank_early_ones() {
        assert!(TaskType::Finalize.priority() > TaskType::AddPiece.priority());
        assert!(TaskType::Fetch.priority() > TaskType::PreCommit1.priority());
        assert!(TaskType::Commit2.priority() > TaskType::PreCommit2.priority());
    }
}
