use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};

use crate::error::SchedError;
use crate::metrics::SchedMetrics;
use crate::resource::{ResourceNeed, WorkerResources, task_cost};
use crate::sched::{DisableRequest, Scheduler};
use crate::task::{TaskRequest, TaskType};
use crate::window::{SchedWindow, WindowRequest, compact_windows};
use crate::worker::{SessionStatus, WorkerHandle, WorkerId};

/// Per-worker driver: keeps window requests outstanding, heartbeats the
/// remote end, folds delivered windows together and hands their tasks to
/// executions as the `preparing` account admits them.
pub(crate) struct SchedWorker {
    sched: Arc<Scheduler>,
    handle: Arc<WorkerHandle>,
    wid: WorkerId,

    scheduled_tx: mpsc::Sender<SchedWindow>,
    scheduled_rx: mpsc::Receiver<SchedWindow>,
    task_done_tx: mpsc::Sender<()>,
    task_done_rx: mpsc::Receiver<()>,

    windows_requested: usize,
}

enum Update {
    Heartbeat,
    Window(SchedWindow),
    TaskDone,
    Closing,
}

impl SchedWorker {
    pub(crate) fn new(sched: Arc<Scheduler>, handle: Arc<WorkerHandle>, wid: WorkerId) -> Self {
        let (scheduled_tx, scheduled_rx) = mpsc::channel(sched.cfg.sched_windows.max(1));
        let (task_done_tx, task_done_rx) = mpsc::channel(1);
        Self {
            sched,
            handle,
            wid,
            scheduled_tx,
            scheduled_rx,
            task_done_tx,
            task_done_rx,
            windows_requested: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut closing = self.sched.closing_rx();
        let mut worker_closing = self.handle.closing_rx();

        let mut heartbeat = tokio::time::interval(self.sched.cfg.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick of a fresh interval fires immediately
        heartbeat.tick().await;

        'outer: loop {
            // ask for more windows if we have room for them (non-blocking)
            if self.handle.is_enabled() && !self.request_windows() {
                break 'outer;
            }

            // wait for a window to come in or for a task to finish preparing
            loop {
                if !self
                    .check_session(&mut heartbeat, &mut closing, &mut worker_closing)
                    .await
                {
                    break 'outer;
                }

                // session looks good; pick the worker back up if a failed
                // probe had parked it
                if !self.handle.enabled.swap(true, Ordering::AcqRel) {
                    log::info!("worker {} re-enabled", self.wid);
                    continue 'outer;
                }

                match self
                    .wait_for_updates(&mut heartbeat, &mut closing, &mut worker_closing)
                    .await
                {
                    Update::Heartbeat => continue,
                    Update::Closing => break 'outer,
                    Update::Window(w) => {
                        self.handle.windows.lock().push(w);
                        break;
                    }
                    Update::TaskDone => {
                        // a task finished preparing, so space may have freed
                        // somewhere; let the dispatcher rerun its matching
                        self.sched.poke();
                        break;
                    }
                }
            }

            self.process_windows();
        }

        self.teardown().await;
    }

    fn request_windows(&mut self) -> bool {
        while self.windows_requested < self.sched.cfg.sched_windows {
            let request = WindowRequest {
                worker: self.wid,
                delivery: self.scheduled_tx.clone(),
            };
            if self.sched.send_window_request(request).is_err() {
                return false; // scheduler gone
            }
            self.windows_requested += 1;
        }
        true
    }

    /// Probe the remote session. Returns false when this handle is done for:
    /// the session id changed, the worker reported itself closed, or closure
    /// was signalled while we waited out an outage.
    async fn check_session(
        &mut self,
        heartbeat: &mut Interval,
        closing: &mut watch::Receiver<bool>,
        worker_closing: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let probe = tokio::time::timeout(
                self.sched.cfg.probe_timeout(),
                self.handle.rpc.session(),
            )
            .await;

            let err = match probe {
                Ok(Ok(SessionStatus::Active(id))) if WorkerId(id) == self.wid => return true,
                Ok(Ok(SessionStatus::Active(id))) => {
                    log::warn!(
                        "worker session changed (worker restarted?), initial {}, current {}",
                        self.wid,
                        id
                    );
                    self.handle.invalidate();
                    return false;
                }
                Ok(Ok(SessionStatus::Closed)) => {
                    log::warn!("worker {} reports a closed session", self.wid);
                    self.handle.invalidate();
                    return false;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "session probe timed out".to_string(),
            };

            // likely a temporary outage: park the worker, keep probing
            log::warn!("failed to check worker session: {}", err);
            if !self.disable().await {
                return false;
            }

            enum Outage {
                Retry,
                Recv(SchedWindow),
                Closed,
            }

            let outage = tokio::select! {
                _ = heartbeat.tick() => Outage::Retry,
                Some(w) = self.scheduled_rx.recv() => Outage::Recv(w),
                _ = closing.wait_for(|c| *c) => Outage::Closed,
                _ = worker_closing.wait_for(|c| *c) => Outage::Closed,
            };

            match outage {
                Outage::Retry => continue,
                Outage::Closed => return false,
                Outage::Recv(w) => {
                    // was in flight when we disabled; stash it and hand it
                    // straight back for re-placement
                    self.handle.windows.lock().push(w);
                    if !self.disable().await {
                        return false;
                    }
                }
            }
        }
    }

    /// Hand this worker's undispatched windows back to the scheduler for
    /// re-placement. Returns false when the scheduler is no longer there to
    /// take them (their tasks are answered with a closed error instead).
    async fn disable(&mut self) -> bool {
        let windows = std::mem::take(&mut *self.handle.windows.lock());
        let (done_tx, done_rx) = oneshot::channel();
        let request = DisableRequest {
            wid: self.wid,
            windows,
            done: done_tx,
        };
        match self.sched.send_disable(request) {
            Ok(()) => {}
            Err(request) => {
                for window in request.windows {
                    for task in window.todo {
                        task.respond(Err(SchedError::SchedulerClosed));
                    }
                }
                return false;
            }
        }
        if done_rx.await.is_err() {
            return false;
        }
        self.windows_requested = 0;
        true
    }

    async fn wait_for_updates(
        &mut self,
        heartbeat: &mut Interval,
        closing: &mut watch::Receiver<bool>,
        worker_closing: &mut watch::Receiver<bool>,
    ) -> Update {
        tokio::select! {
            _ = heartbeat.tick() => Update::Heartbeat,
            Some(w) = self.scheduled_rx.recv() => Update::Window(w),
            Some(_) = self.task_done_rx.recv() => {
                log::debug!("task done, worker {}", self.wid);
                Update::TaskDone
            }
            _ = closing.wait_for(|c| *c) => Update::Closing,
            _ = worker_closing.wait_for(|c| *c) => Update::Closing,
        }
    }

    /// Fold windows together, then walk the front window handing tasks to
    /// executions while the `preparing` account admits them.
    fn process_windows(&mut self) {
        let (totals, group) = {
            let info = self.handle.info.read();
            (info.resources, info.group.clone())
        };

        let handle = Arc::clone(&self.handle);
        let mut windows = handle.windows.lock();

        let compacted = compact_windows(&mut windows, &totals);
        if compacted > 0 {
            self.windows_requested = self.windows_requested.saturating_sub(compacted);
            self.sched
                .metrics
                .windows_compacted
                .fetch_add(compacted as u64, Ordering::Relaxed);
        }

        self.assign_windows(&mut windows, &totals, &group);
    }

    fn assign_windows(
        &mut self,
        windows: &mut Vec<SchedWindow>,
        totals: &WorkerResources,
        group: &str,
    ) {
        'assign: while !windows.is_empty() {
            let front = &mut windows[0];

            // start tasks at lower indexes first
            while !front.todo.is_empty() {
                let tidx = {
                    let preparing = self.handle.preparing.lock();
                    front.todo.iter().position(|t| {
                        t.remote_c2
                            || preparing
                                .can_handle(&task_cost(t.task_type, t.sector.proof_type), totals)
                    })
                };
                let Some(tidx) = tidx else {
                    // head-of-line: nothing in the front window fits yet
                    break 'assign;
                };

                let todo = front.todo.remove(tidx);
                log::debug!(
                    "assigning sector {} task {} to worker {}",
                    todo.sector.id,
                    todo.task_type,
                    self.wid
                );
                if let Err(e) = self.start_task(Arc::clone(&todo), group) {
                    log::error!("starting task on worker {}: {}", self.wid, e);
                    todo.respond(Err(e));
                }
                // the window's allocation is left in place on purpose: it
                // keeps its claim until the whole window drains
            }

            windows.remove(0);
            self.windows_requested = self.windows_requested.saturating_sub(1);
        }
    }

    /// Pin the sector to this worker's group, reserve the prepare slot and
    /// spawn the execution.
    fn start_task(&self, request: Arc<TaskRequest>, group: &str) -> Result<(), SchedError> {
        let need = task_cost(request.task_type, request.sector.proof_type);

        self.sched
            .groups
            .bind_sector(request.sector.id.number, group)?;

        if !request.remote_c2 {
            self.handle.preparing.lock().add(&need);
        }

        let execution = TaskExecution {
            sched: Arc::clone(&self.sched),
            handle: Arc::clone(&self.handle),
            request,
            need,
            task_done: self.task_done_tx.clone(),
        };
        tokio::spawn(execution.run());
        Ok(())
    }

    async fn teardown(mut self) {
        log::warn!("worker {} closing", self.wid);

        // pick up windows still sitting in the delivery channel so they get
        // re-placed (or answered) with everything else
        while let Ok(window) = self.scheduled_rx.try_recv() {
            self.handle.windows.lock().push(window);
        }

        if !self.disable().await {
            // the scheduler is gone; answer whatever is still windowed here
            let windows = std::mem::take(&mut *self.handle.windows.lock());
            for window in windows {
                for task in window.todo {
                    task.respond(Err(SchedError::SchedulerClosed));
                }
            }
        }

        self.sched.remove_worker(self.wid, &self.handle);

        if let Some(closed) = self.handle.closed_tx.lock().take() {
            let _ = closed.send(());
        }
    }
}

/// One task's trip through prepare and work on its chosen worker.
struct TaskExecution {
    sched: Arc<Scheduler>,
    handle: Arc<WorkerHandle>,
    request: Arc<TaskRequest>,
    need: ResourceNeed,
    task_done: mpsc::Sender<()>,
}

impl TaskExecution {
    async fn run(self) {
        let Self {
            sched,
            handle,
            request,
            need,
            task_done,
        } = self;

        let mut invalid = handle.invalid_rx();
        let cancel = request.cancel.clone();
        let _running = handle.track_running(request.sector.id, request.task_type);

        // prepare phase, e.g. fetching sector data from another worker
        let prepared = match request.take_prepare() {
            Some(prepare) => {
                let fut = prepare(cancel.clone(), Arc::clone(&handle.rpc));
                tokio::select! {
                    res = fut => res,
                    _ = cancel.cancelled() => Err(SchedError::Cancelled),
                    _ = invalid.wait_for(|v| *v) => Err(SchedError::SessionInvalidated),
                }
            }
            None => Ok(()),
        };

        if let Err(e) = prepared {
            let _ = handle
                .rpc
                .delete_store(request.sector.id, request.task_type)
                .await;
            if !request.remote_c2 {
                handle.free_preparing(&need);
            }
            let _ = task_done.try_send(());
            request.respond(Err(match e {
                SchedError::Cancelled => {
                    SchedMetrics::incr(&sched.metrics.tasks_cancelled);
                    e
                }
                SchedError::SessionInvalidated => {
                    SchedMetrics::incr(&sched.metrics.tasks_failed);
                    e
                }
                other => {
                    SchedMetrics::incr(&sched.metrics.tasks_failed);
                    SchedError::PrepareFailed(other.to_string())
                }
            }));
            return;
        }

        // prepare -> active boundary. The prepare reservation is held until
        // the active one lands, then released; task_done fires here so the
        // worker lines up its next window while work is still running.
        let reservation = if request.remote_c2 {
            None
        } else {
            let reserved = tokio::select! {
                r = handle.reserve_active(need) => Some(r),
                _ = cancel.cancelled() => None,
                _ = invalid.wait_for(|v| *v) => None,
                _ = sched.closed() => None,
            };
            match reserved {
                Some(r) => Some(r),
                None => {
                    let aborted = if cancel.is_cancelled() {
                        SchedMetrics::incr(&sched.metrics.tasks_cancelled);
                        SchedError::Cancelled
                    } else if *invalid.borrow() {
                        SchedMetrics::incr(&sched.metrics.tasks_failed);
                        SchedError::SessionInvalidated
                    } else {
                        SchedMetrics::incr(&sched.metrics.tasks_failed);
                        SchedError::SchedulerClosed
                    };
                    handle.free_preparing(&need);
                    let _ = task_done.try_send(());
                    request.respond(Err(aborted));
                    return;
                }
            }
        };
        if !request.remote_c2 {
            handle.free_preparing(&need);
        }
        let _ = task_done.try_send(());

        // work phase
        let worked = match request.take_work() {
            Some(work) => {
                let fut = work(cancel.clone(), Arc::clone(&handle.rpc));
                tokio::select! {
                    res = fut => res,
                    _ = cancel.cancelled() => Err(SchedError::Cancelled),
                    _ = invalid.wait_for(|v| *v) => Err(SchedError::SessionInvalidated),
                }
            }
            None => Ok(()),
        };

        let _ = handle
            .rpc
            .delete_store(request.sector.id, request.task_type)
            .await;

        // a fetched sector has left this group; let it land anywhere next
        if request.task_type == TaskType::Fetch && worked.is_ok() {
            match sched.groups.delete_sector_group(request.sector.id.number) {
                Ok(()) => log::debug!(
                    "sector {} fetched, group binding released",
                    request.sector.id
                ),
                Err(e) => log::warn!(
                    "releasing group binding for sector {}: {}",
                    request.sector.id,
                    e
                ),
            }
        }

        drop(reservation);

        match worked {
            Ok(()) => {
                SchedMetrics::incr(&sched.metrics.tasks_completed);
                request.respond(Ok(()));
            }
            Err(e) => {
                request.respond(Err(match e {
                    SchedError::Cancelled => {
                        SchedMetrics::incr(&sched.metrics.tasks_cancelled);
                        e
                    }
                    SchedError::SessionInvalidated => {
                        SchedMetrics::incr(&sched.metrics.tasks_failed);
                        e
                    }
                    other => {
                        SchedMetrics::incr(&sched.metrics.tasks_failed);
                        SchedError::WorkFailed(other.to_string())
                    }
                }));
            }
        }
    }
}
