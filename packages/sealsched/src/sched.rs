use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SchedConfig;
use crate::error::SchedError;
use crate::group::GroupIndex;
use crate::metrics::SchedMetrics;
use crate::resource::task_cost;
use crate::sched_worker::SchedWorker;
use crate::selector::StorageIndex;
use crate::task::{TaskHandle, TaskRequest, TaskSpec, TaskType};
use crate::window::{SchedWindow, WindowRequest};
use crate::worker::{SessionStatus, WorkerHandle, WorkerId, WorkerRpc};

/// A worker loop handing its undispatched windows back for re-placement.
pub(crate) struct DisableRequest {
    pub wid: WorkerId,
    pub windows: Vec<SchedWindow>,
    pub done: oneshot::Sender<()>,
}

/// Queue and open-window state owned by the control loop, readable by the
/// stats surface.
pub(crate) struct SchedState {
    pub queue: Vec<Arc<TaskRequest>>,
    pub open_windows: Vec<WindowRequest>,
}

struct SchedInbox {
    schedule_rx: mpsc::UnboundedReceiver<Arc<TaskRequest>>,
    window_rx: mpsc::UnboundedReceiver<WindowRequest>,
    change_rx: mpsc::Receiver<()>,
    disable_rx: mpsc::UnboundedReceiver<DisableRequest>,
}

/// The sealing task dispatcher.
///
/// All scheduling decisions are serialized on one control task; worker loops
/// and task executions only talk to it through channels. Dropping the
/// scheduler without [`Scheduler::close`] leaves the control task running,
/// so callers should close explicitly.
pub struct Scheduler {
    pub(crate) cfg: SchedConfig,
    pub(crate) workers: DashMap<WorkerId, Arc<WorkerHandle>>,
    pub(crate) groups: GroupIndex,
    pub(crate) index: Arc<dyn StorageIndex>,
    pub(crate) metrics: SchedMetrics,
    pub(crate) state: Mutex<SchedState>,

    schedule_tx: mpsc::UnboundedSender<Arc<TaskRequest>>,
    window_tx: mpsc::UnboundedSender<WindowRequest>,
    change_tx: mpsc::Sender<()>,
    disable_tx: mpsc::UnboundedSender<DisableRequest>,
    closing: watch::Sender<bool>,

    next_seq: AtomicU64,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler and spawn its control loop onto the current tokio
    /// runtime. `index` backs the storage-aware selectors and `try_sched`.
    pub fn new(
        cfg: SchedConfig,
        index: Arc<dyn StorageIndex>,
    ) -> Result<Arc<Self>, SchedError> {
        let groups = GroupIndex::open(&cfg.group_file)?;

        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (window_tx, window_rx) = mpsc::unbounded_channel();
        let (change_tx, change_rx) = mpsc::channel(1);
        let (disable_tx, disable_rx) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);

        let sched = Arc::new(Self {
            cfg,
            workers: DashMap::new(),
            groups,
            index,
            metrics: SchedMetrics::default(),
            state: Mutex::new(SchedState {
                queue: Vec::new(),
                open_windows: Vec::new(),
            }),
            schedule_tx,
            window_tx,
            change_tx,
            disable_tx,
            closing,
            next_seq: AtomicU64::new(0),
            run_handle: Mutex::new(None),
        });

        let inbox = SchedInbox {
            schedule_rx,
            window_rx,
            change_rx,
            disable_rx,
        };
        let handle = tokio::spawn(Arc::clone(&sched).run(inbox));
        *sched.run_handle.lock() = Some(handle);

        Ok(sched)
    }

    /// Submit a task. The returned handle resolves exactly once, with the
    /// task's success, failure or cancellation.
    pub fn schedule(&self, spec: TaskSpec) -> Result<TaskHandle, SchedError> {
        if self.is_closing() {
            return Err(SchedError::SchedulerClosed);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (request, result) = TaskRequest::new(spec, seq, self.change_tx.clone());
        self.schedule_tx
            .send(Arc::clone(&request))
            .map_err(|_| SchedError::SchedulerClosed)?;
        SchedMetrics::incr(&self.metrics.tasks_scheduled);
        Ok(TaskHandle::new(request, result))
    }

    /// Register a worker and start driving it. The returned id doubles as
    /// the worker's session id; a duplicate registration of a live session
    /// is a no-op.
    pub async fn run_worker(
        self: &Arc<Self>,
        rpc: Arc<dyn WorkerRpc>,
    ) -> Result<WorkerId, SchedError> {
        if self.is_closing() {
            return Err(SchedError::SchedulerClosed);
        }
        let info = rpc.info().await?;
        let wid = match rpc.session().await? {
            SessionStatus::Active(id) => WorkerId(id),
            SessionStatus::Closed => return Err(SchedError::WorkerClosed),
        };

        let handle = WorkerHandle::new(rpc, info.clone());
        match self.workers.entry(wid) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // already driven by another loop
                log::warn!("duplicated worker added: {}", wid);
                return Ok(wid);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&handle));
            }
        }
        self.groups.add_worker(&info.group, wid);
        SchedMetrics::incr(&self.metrics.workers_added);
        log::info!(
            "worker {} registered (host {}, group {})",
            wid,
            info.hostname,
            info.group
        );

        tokio::spawn(SchedWorker::new(Arc::clone(self), handle, wid).run());
        Ok(wid)
    }

    /// Ask a worker's loop to exit and wait briefly for it to acknowledge.
    pub async fn drop_worker(&self, wid: WorkerId) -> Result<(), SchedError> {
        let handle = self
            .workers
            .get(&wid)
            .map(|h| Arc::clone(h.value()))
            .ok_or(SchedError::WorkerNotFound(wid.0))?;
        handle.request_close();

        let closed = handle.closed_rx.lock().take();
        if let Some(rx) = closed
            && tokio::time::timeout(self.cfg.worker_close_timeout(), rx)
                .await
                .is_err()
        {
            log::error!("timeout closing worker loop {}", wid);
        }
        Ok(())
    }

    /// Flag closure, answer queued requests and stop the control loop.
    /// Worker loops observe the same signal and exit without draining.
    pub async fn close(&self) {
        if self.closing.send_replace(true) {
            return; // already closing
        }
        let run = self.run_handle.lock().take();
        if let Some(handle) = run {
            let _ = handle.await;
        }
    }

    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    pub(crate) fn closing_rx(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Resolves once scheduler closure has been signalled.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Hint that resources may have freed; cheap and lossy by design.
    pub(crate) fn poke(&self) {
        let _ = self.change_tx.try_send(());
    }

    pub(crate) fn send_window_request(&self, request: WindowRequest) -> Result<(), ()> {
        self.window_tx.send(request).map_err(|_| ())
    }

    pub(crate) fn send_disable(
        &self,
        request: DisableRequest,
    ) -> Result<(), DisableRequest> {
        self.disable_tx.send(request).map_err(|e| e.0)
    }

    /// Drop a worker from every structure that knows it: the worker map,
    /// its group list and the open-window list.
    pub(crate) fn remove_worker(&self, wid: WorkerId, handle: &Arc<WorkerHandle>) {
        if !handle.group_removed.swap(true, Ordering::AcqRel) {
            let group = handle.info.read().group.clone();
            self.groups.remove_worker(&group, wid);
        }
        self.workers.remove(&wid);
        self.state.lock().open_windows.retain(|w| w.worker != wid);
        SchedMetrics::incr(&self.metrics.workers_dropped);
        log::debug!("worker {} dropped", wid);
    }

    async fn run(self: Arc<Self>, mut inbox: SchedInbox) {
        let mut closing = self.closing.subscribe();
        log::info!("scheduler control loop started");

        loop {
            tokio::select! {
                Some(request) = inbox.schedule_rx.recv() => {
                    self.state.lock().queue.push(request);
                }
                Some(window_request) = inbox.window_rx.recv() => {
                    self.state.lock().open_windows.push(window_request);
                }
                Some(_) = inbox.change_rx.recv() => {}
                Some(request) = inbox.disable_rx.recv() => {
                    self.handle_disable(request);
                }
                _ = closing.wait_for(|c| *c) => {
                    self.drain_on_close(&mut inbox);
                    break;
                }
            }

            self.match_pass().await;
        }

        log::info!("scheduler control loop exited");
    }

    fn handle_disable(&self, request: DisableRequest) {
        if let Some(handle) = self.workers.get(&request.wid) {
            handle.enabled.store(false, Ordering::Release);
        }

        let mut returned = 0;
        {
            let mut state = self.state.lock();
            state.open_windows.retain(|w| w.worker != request.wid);
            for window in request.windows {
                returned += window.todo.len();
                state.queue.extend(window.todo);
            }
        }
        if returned > 0 {
            log::debug!(
                "worker {} disabled, {} tasks returned to the queue",
                request.wid,
                returned
            );
        }

        let _ = request.done.send(());
    }

    /// Answer everything still pending and persist the group index.
    fn drain_on_close(&self, inbox: &mut SchedInbox) {
        let queue = std::mem::take(&mut self.state.lock().queue);
        for task in queue {
            task.respond(Err(SchedError::SchedulerClosed));
        }
        while let Ok(task) = inbox.schedule_rx.try_recv() {
            task.respond(Err(SchedError::SchedulerClosed));
        }
        while let Ok(request) = inbox.disable_rx.try_recv() {
            for window in request.windows {
                for task in window.todo {
                    task.respond(Err(SchedError::SchedulerClosed));
                }
            }
            let _ = request.done.send(());
        }

        if let Err(e) = self.groups.flush() {
            log::error!("flushing group index on close: {}", e);
        }
    }

    /// One greedy matching round: walk queued tasks by priority and try to
    /// place each into a window offered by an acceptable worker. Windows
    /// that picked up work are delivered and their requests retired.
    async fn match_pass(&self) {
        SchedMetrics::incr(&self.metrics.match_passes);

        let (mut queue, open) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.queue),
                std::mem::take(&mut state.open_windows),
            )
        };

        queue.sort_by_key(|t| (Reverse(t.task_type.priority()), t.seq));

        let mut pending: Vec<SchedWindow> = open.iter().map(|_| SchedWindow::default()).collect();
        let mut remaining: Vec<Arc<TaskRequest>> = Vec::new();

        'tasks: for task in queue {
            if task.is_cancelled() {
                SchedMetrics::incr(&self.metrics.tasks_cancelled);
                task.respond(Err(SchedError::Cancelled));
                continue;
            }

            let bound = self.groups.sector_group(task.sector.id.number);
            // a sector already sealing in a group sticks to it, except for
            // fetches, which move data between groups by definition
            let hard = bound.is_some() && task.task_type != TaskType::Fetch;
            let preferred = bound.or_else(|| task.group.clone());

            // one scan restricted to the preferred group, then one over all
            // workers unless the binding is hard
            let mut scans: Vec<Option<&str>> = Vec::with_capacity(2);
            match preferred.as_deref() {
                Some(g) => {
                    scans.push(Some(g));
                    if !hard {
                        scans.push(None);
                    }
                }
                None => scans.push(None),
            }

            for restrict in &scans {
                for (wi, window_request) in open.iter().enumerate() {
                    let Some(handle) = self
                        .workers
                        .get(&window_request.worker)
                        .map(|h| Arc::clone(h.value()))
                    else {
                        continue;
                    };
                    if !handle.is_enabled() {
                        continue;
                    }

                    let (group, totals, supported) = {
                        let info = handle.info.read();
                        (
                            info.group.clone(),
                            info.resources,
                            info.task_types.contains(&task.task_type)
                                && info.proof_types.contains(&task.sector.proof_type),
                        )
                    };
                    if let Some(g) = restrict
                        && group != *g
                    {
                        continue;
                    }
                    if !supported {
                        continue;
                    }

                    let need = task_cost(task.task_type, task.sector.proof_type);
                    if !task.remote_c2 {
                        if !handle.active_snapshot().can_handle(&need, &totals) {
                            continue;
                        }
                        if !pending[wi].allocated.can_handle(&need, &totals) {
                            continue;
                        }
                    }

                    let selected = tokio::time::timeout(
                        self.cfg.selector_timeout(),
                        task.selector
                            .ok(task.task_type, task.sector.proof_type, &handle),
                    )
                    .await;
                    match selected {
                        Ok(Ok(true)) => {}
                        Ok(Ok(false)) => continue,
                        Ok(Err(e)) => {
                            log::warn!("selector error for sector {}: {}", task.sector.id, e);
                            continue;
                        }
                        Err(_) => {
                            log::warn!("selector timed out for sector {}", task.sector.id);
                            continue;
                        }
                    }

                    if !task.remote_c2 {
                        pending[wi].allocated.add(&need);
                    }
                    pending[wi].todo.push(Arc::clone(&task));
                    continue 'tasks;
                }
            }

            remaining.push(task);
        }

        // deliver the windows that picked up work; the rest stay open
        let mut kept: Vec<WindowRequest> = Vec::new();
        for (window_request, window) in open.into_iter().zip(pending) {
            if window.todo.is_empty() {
                kept.push(window_request);
                continue;
            }
            SchedMetrics::incr(&self.metrics.windows_sent);
            if let Err(e) = window_request.delivery.try_send(window) {
                let window = match e {
                    mpsc::error::TrySendError::Full(w) => w,
                    mpsc::error::TrySendError::Closed(w) => w,
                };
                log::warn!(
                    "window delivery to worker {} failed, requeueing {} tasks",
                    window_request.worker,
                    window.todo.len()
                );
                remaining.extend(window.todo);
            }
        }

        let mut state = self.state.lock();
        // anything that arrived mid-pass sits in state already; the seq sort
        // at the next pass restores submission order
        remaining.extend(state.queue.drain(..));
        state.queue = remaining;
        kept.extend(state.open_windows.drain(..));
        state.open_windows = kept;
    }
}
