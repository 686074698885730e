use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot, watch};
use uuid::Uuid;

use crate::error::SchedError;
use crate::resource::{ResourceAccount, ResourceNeed, WorkerResources};
use crate::sector::{ProofType, SectorId};
use crate::task::TaskType;
use crate::window::SchedWindow;

/// Identity of one worker registration, equal to the remote session id.
/// A restarted worker comes back with a fresh session id and therefore a
/// fresh `WorkerId`; the old handle is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the session probe learned about the remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active(Uuid),
    /// The worker has shut down cleanly.
    Closed,
}

/// Static facts a worker reports once at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub hostname: String,
    pub group: String,
    pub resources: WorkerResources,
    pub task_types: HashSet<TaskType>,
    pub proof_types: HashSet<ProofType>,
}

/// Admin key/value parameters a worker exposes.
pub type WorkerParams = HashMap<String, String>;

/// The worker capability set the scheduler needs, polymorphic over the
/// transport actually carrying the calls.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    async fn info(&self) -> Result<WorkerInfo, SchedError>;

    /// May be called repeatedly; a changed id means the worker restarted.
    async fn session(&self) -> Result<SessionStatus, SchedError>;

    async fn has_remote_c2(&self) -> Result<bool, SchedError>;

    async fn worker_group(&self) -> Result<String, SchedError>;

    async fn worker_params(&self) -> Result<WorkerParams, SchedError>;

    async fn set_worker_param(&self, key: &str, value: &str) -> Result<(), SchedError>;

    /// Best-effort cache cleanup after a task leaves the worker.
    async fn delete_store(&self, sector: SectorId, task_type: TaskType) -> Result<(), SchedError>;
}

/// A task currently executing on a worker (prepare or work phase).
#[derive(Debug, Clone, Serialize)]
pub struct RunningJob {
    #[serde(skip)]
    pub(crate) id: u64,
    pub sector: SectorId,
    pub task_type: TaskType,
    pub start: DateTime<Utc>,
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduler-side state for one registered worker.
///
/// Owned by the scheduler's worker map; the worker loop and task executions
/// hold `Arc` clones. The `preparing` and `active` accounts cover the two
/// phases of task execution and must both fit within `info.resources`.
pub struct WorkerHandle {
    pub rpc: Arc<dyn WorkerRpc>,
    pub info: RwLock<WorkerInfo>,
    pub enabled: AtomicBool,

    pub(crate) preparing: Mutex<ResourceAccount>,
    pub(crate) active: Mutex<ResourceAccount>,

    /// Windows delivered by the dispatcher, in delivery order
    pub(crate) windows: Mutex<Vec<SchedWindow>>,
    pub(crate) running: Mutex<Vec<RunningJob>>,

    /// Signalled whenever a reservation is released
    pub(crate) resource_free: Notify,

    /// Guards against double removal from the group index
    pub(crate) group_removed: AtomicBool,

    closing: watch::Sender<bool>,
    invalid: watch::Sender<bool>,
    pub(crate) closed_tx: Mutex<Option<oneshot::Sender<()>>>,
    pub(crate) closed_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl WorkerHandle {
    pub(crate) fn new(rpc: Arc<dyn WorkerRpc>, info: WorkerInfo) -> Arc<Self> {
        let (closing, _) = watch::channel(false);
        let (invalid, _) = watch::channel(false);
        let (closed_tx, closed_rx) = oneshot::channel();
        Arc::new(Self {
            rpc,
            info: RwLock::new(info),
            enabled: AtomicBool::new(true),
            preparing: Mutex::new(ResourceAccount::default()),
            active: Mutex::new(ResourceAccount::default()),
            windows: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            resource_free: Notify::new(),
            group_removed: AtomicBool::new(false),
            closing,
            invalid,
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx: Mutex::new(Some(closed_rx)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Ask the worker loop to exit. Idempotent.
    pub(crate) fn request_close(&self) {
        self.closing.send_replace(true);
    }

    /// Fatal teardown after a session change: in-flight task executions
    /// observing this abort with [`SchedError::SessionInvalidated`].
    pub(crate) fn invalidate(&self) {
        self.invalid.send_replace(true);
        self.request_close();
    }

    pub(crate) fn closing_rx(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub(crate) fn invalid_rx(&self) -> watch::Receiver<bool> {
        self.invalid.subscribe()
    }

    pub(crate) fn active_snapshot(&self) -> ResourceAccount {
        *self.active.lock()
    }

    /// Block until the `active` account can admit `need`, then reserve it.
    /// The reservation is released when the returned guard drops, so the
    /// pairing survives cancellation of the surrounding future.
    pub(crate) async fn reserve_active(self: &Arc<Self>, need: ResourceNeed) -> ActiveReservation {
        loop {
            // register for wakeups before the admission check, so a free()
            // landing in between is not lost
            let mut notified = std::pin::pin!(self.resource_free.notified());
            notified.as_mut().enable();
            {
                let total = self.info.read().resources;
                let mut active = self.active.lock();
                if active.can_handle(&need, &total) {
                    active.add(&need);
                    return ActiveReservation {
                        handle: Arc::clone(self),
                        need,
                    };
                }
            }
            notified.await;
        }
    }

    pub(crate) fn free_preparing(&self, need: &ResourceNeed) {
        self.preparing.lock().free(need);
        self.resource_free.notify_waiters();
    }

    pub(crate) fn track_running(
        self: &Arc<Self>,
        sector: SectorId,
        task_type: TaskType,
    ) -> RunningGuard {
        let id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
        self.running.lock().push(RunningJob {
            id,
            sector,
            task_type,
            start: Utc::now(),
        });
        RunningGuard {
            handle: Arc::clone(self),
            id,
        }
    }
}

/// RAII reservation against a worker's `active` account.
pub(crate) struct ActiveReservation {
    handle: Arc<WorkerHandle>,
    need: ResourceNeed,
}

impl Drop for ActiveReservation {
    fn drop(&mut self) {
        self.handle.active.lock().free(&self.need);
        self.handle.resource_free.notify_waiters();
    }
}

/// Removes the tracked running job when the execution ends, on any path.
pub(crate) struct RunningGuard {
    handle: Arc<WorkerHandle>,
    id: u64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.handle.running.lock().retain(|j| j.id != self.id);
    }
}
