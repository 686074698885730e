//! End-to-end scheduler scenarios against scripted in-process workers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use sealsched::{
    ProofType, SchedConfig, SchedError, Scheduler, SectorFileType, SectorId, SectorRef,
    SessionStatus, StorageIndex, TaskSpec, TaskType, WorkerAction, WorkerHandle, WorkerInfo,
    WorkerParams, WorkerResources, WorkerRpc, WorkerSelector, action,
};

const GIB: u64 = 1 << 30;

/// Storage index that lets every listed host allocate anything.
struct OpenIndex {
    hosts: Vec<String>,
}

#[async_trait]
impl StorageIndex for OpenIndex {
    async fn find_sector(
        &self,
        _sector: SectorId,
        _types: SectorFileType,
    ) -> Result<Vec<String>, SchedError> {
        Ok(Vec::new())
    }

    async fn can_allocate(&self, _types: SectorFileType) -> Result<Vec<String>, SchedError> {
        Ok(self.hosts.clone())
    }
}

struct AnyWorker;

#[async_trait]
impl WorkerSelector for AnyWorker {
    async fn ok(
        &self,
        _task_type: TaskType,
        _proof_type: ProofType,
        _worker: &WorkerHandle,
    ) -> Result<bool, SchedError> {
        Ok(true)
    }
}

/// Rejects every worker, keeping a task parked in the queue.
struct NoWorker;

#[async_trait]
impl WorkerSelector for NoWorker {
    async fn ok(
        &self,
        _task_type: TaskType,
        _proof_type: ProofType,
        _worker: &WorkerHandle,
    ) -> Result<bool, SchedError> {
        Ok(false)
    }
}

struct MockWorker {
    session: Mutex<Uuid>,
    fail_session: AtomicBool,
    info: WorkerInfo,
    remote_c2: bool,
    deleted: Mutex<Vec<(SectorId, TaskType)>>,
    params: Mutex<WorkerParams>,
}

impl MockWorker {
    fn new(hostname: &str, group: &str, cpus: u64, gpu: bool) -> Arc<Self> {
        Self::with_proofs(hostname, group, cpus, gpu, &ProofType::ALL)
    }

    fn with_proofs(
        hostname: &str,
        group: &str,
        cpus: u64,
        gpu: bool,
        proofs: &[ProofType],
    ) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(Uuid::new_v4()),
            fail_session: AtomicBool::new(false),
            info: WorkerInfo {
                hostname: hostname.to_string(),
                group: group.to_string(),
                resources: WorkerResources {
                    cpus,
                    gpu,
                    ram: 2048 * GIB,
                    ram_swap: 4096 * GIB,
                },
                task_types: TaskType::ALL.into_iter().collect(),
                proof_types: proofs.iter().copied().collect(),
            },
            remote_c2: false,
            deleted: Mutex::new(Vec::new()),
            params: Mutex::new(WorkerParams::new()),
        })
    }

    /// Simulate a remote restart: the next session probe reports a new id.
    fn restart(&self) {
        *self.session.lock() = Uuid::new_v4();
    }
}

#[async_trait]
impl WorkerRpc for MockWorker {
    async fn info(&self) -> Result<WorkerInfo, SchedError> {
        Ok(self.info.clone())
    }

    async fn session(&self) -> Result<SessionStatus, SchedError> {
        if self.fail_session.load(Ordering::Acquire) {
            return Err(SchedError::Rpc("connection refused".to_string()));
        }
        Ok(SessionStatus::Active(*self.session.lock()))
    }

    async fn has_remote_c2(&self) -> Result<bool, SchedError> {
        Ok(self.remote_c2)
    }

    async fn worker_group(&self) -> Result<String, SchedError> {
        Ok(self.info.group.clone())
    }

    async fn worker_params(&self) -> Result<WorkerParams, SchedError> {
        Ok(self.params.lock().clone())
    }

    async fn set_worker_param(&self, key: &str, value: &str) -> Result<(), SchedError> {
        self.params.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_store(&self, sector: SectorId, task_type: TaskType) -> Result<(), SchedError> {
        self.deleted.lock().push((sector, task_type));
        Ok(())
    }
}

fn sector(number: u64, proof: ProofType) -> SectorRef {
    SectorRef {
        id: SectorId { miner: 1000, number },
        proof_type: proof,
    }
}

fn config(dir: &tempfile::TempDir) -> SchedConfig {
    SchedConfig {
        heartbeat_interval_secs: 1,
        group_file: dir.path().join("groups.json"),
        ..Default::default()
    }
}

fn ok_action() -> WorkerAction {
    action(|_, _| async { Ok(()) })
}

fn spec(sector: SectorRef, task_type: TaskType) -> TaskSpec {
    TaskSpec {
        sector,
        task_type,
        group: None,
        remote_c2: false,
        selector: Arc::new(AnyWorker),
        prepare: ok_action(),
        work: ok_action(),
    }
}

async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Test 1: happy path. A PC1 lands on the only worker, reserves one cpu
/// while working, binds the sector to the worker's group and succeeds.
#[tokio::test]
async fn test_happy_path_reserves_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    let worker = MockWorker::new("h1", "g1", 8, true);
    sched.run_worker(worker.clone()).await.unwrap();

    let prepared = Arc::new(AtomicBool::new(false));
    let prepared_in_task = Arc::clone(&prepared);
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let handle = sched
        .schedule(TaskSpec {
            prepare: action(move |_, _| async move {
                prepared_in_task.store(true, Ordering::Release);
                Ok(())
            }),
            work: action(move |_, _| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            }),
            ..spec(
                sector(17, ProofType::StackedDrg32GiB),
                TaskType::PreCommit1,
            )
        })
        .unwrap();

    started_rx.await.unwrap();
    assert!(prepared.load(Ordering::Acquire));

    let stats = sched.worker_stats().await;
    assert_eq!(stats.len(), 1);
    let ws = stats.values().next().unwrap();
    assert!(ws.enabled);
    assert_eq!(ws.cpu_use, 1);
    assert_eq!(sched.get_sector_group(17).as_deref(), Some("g1"));

    let jobs = sched.worker_jobs();
    let running: Vec<_> = jobs.values().flatten().collect();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].run_wait, 0);
    assert_eq!(running[0].sector.number, 17);
    assert_eq!(running[0].task_type, TaskType::PreCommit1);

    release_tx.send(()).unwrap();
    handle.wait().await.unwrap();

    assert!(
        worker
            .deleted
            .lock()
            .iter()
            .any(|(s, t)| s.number == 17 && *t == TaskType::PreCommit1)
    );

    eventually("active account to drain", || {
        let sched = Arc::clone(&sched);
        async move {
            let stats = sched.worker_stats().await;
            stats.values().next().unwrap().cpu_use == 0
        }
    })
    .await;

    sched.close().await;
}

/// Test 2: locality. Once a sector starts sealing in a group, later stages
/// stay there even when a bigger worker is idle in another group.
#[tokio::test]
async fn test_group_binding_keeps_sector_tasks_local() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string(), "h2".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    sched
        .run_worker(MockWorker::new("h1", "g1", 8, true))
        .await
        .unwrap();

    let ran_on: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let record = |slot: Arc<Mutex<Vec<String>>>| -> WorkerAction {
        action(move |_, rpc| async move {
            let host = rpc.info().await?.hostname;
            slot.lock().push(host);
            Ok(())
        })
    };

    // the first stage lands on the only worker and binds the sector to g1
    sched
        .schedule(TaskSpec {
            group: Some("g1".to_string()),
            work: record(Arc::clone(&ran_on)),
            ..spec(
                sector(17, ProofType::StackedDrg32GiB),
                TaskType::PreCommit1,
            )
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(sched.get_sector_group(17).as_deref(), Some("g1"));
    assert_eq!(ran_on.lock().as_slice(), ["h1".to_string()]);

    // a much larger worker joins in another group; the binding, not free
    // capacity, pins the second stage
    sched
        .run_worker(MockWorker::new("h2", "g2", 64, true))
        .await
        .unwrap();
    sched
        .schedule(TaskSpec {
            work: record(Arc::clone(&ran_on)),
            ..spec(
                sector(17, ProofType::StackedDrg32GiB),
                TaskType::PreCommit2,
            )
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(
        ran_on.lock().as_slice(),
        ["h1".to_string(), "h1".to_string()]
    );

    sched.close().await;
}

/// Test 3: a completed fetch releases the sector's group binding.
#[tokio::test]
async fn test_fetch_releases_group_binding() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    sched
        .run_worker(MockWorker::new("h1", "g1", 8, true))
        .await
        .unwrap();

    sched
        .schedule(spec(
            sector(17, ProofType::StackedDrg8MiB),
            TaskType::PreCommit1,
        ))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(sched.get_sector_group(17).as_deref(), Some("g1"));

    sched
        .schedule(spec(sector(17, ProofType::StackedDrg8MiB), TaskType::Fetch))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(sched.get_sector_group(17), None);

    sched.close().await;
}

/// Test 4: a heartbeat outage parks the worker and hands its undispatched
/// window back; recovery with the same session id picks everything up.
#[tokio::test]
async fn test_disable_and_recover_redispatches() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    let worker = MockWorker::new("h1", "g1", 1, false);
    sched.run_worker(worker.clone()).await.unwrap();

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    // task A blocks in prepare, pinning the single prepare slot
    let task_a = sched
        .schedule(TaskSpec {
            prepare: action(move |_, _| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            }),
            ..spec(sector(1, ProofType::StackedDrg2KiB), TaskType::PreCommit1)
        })
        .unwrap();
    // task B gets windowed behind it
    let task_b = sched
        .schedule(spec(sector(2, ProofType::StackedDrg2KiB), TaskType::PreCommit1))
        .unwrap();

    started_rx.await.unwrap();

    worker.fail_session.store(true, Ordering::Release);
    eventually("worker to be disabled", || {
        let sched = Arc::clone(&sched);
        async move {
            let stats = sched.worker_stats().await;
            !stats.values().next().unwrap().enabled
        }
    })
    .await;

    worker.fail_session.store(false, Ordering::Release);
    eventually("worker to be re-enabled", || {
        let sched = Arc::clone(&sched);
        async move {
            let stats = sched.worker_stats().await;
            stats.values().next().unwrap().enabled
        }
    })
    .await;

    release_tx.send(()).unwrap();
    task_a.wait().await.unwrap();
    task_b.wait().await.unwrap();

    sched.close().await;
}

/// Test 5: a changed session id is fatal for the handle. In-flight work
/// fails with a session error; queued work moves to the next worker.
#[tokio::test]
async fn test_session_change_drops_handle_and_reschedules() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string(), "h2".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    let worker = MockWorker::new("h1", "g1", 1, false);
    let wid = sched.run_worker(worker.clone()).await.unwrap();

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (_release_tx, release_rx) = oneshot::channel::<()>();

    let task_a = sched
        .schedule(TaskSpec {
            work: action(move |_, _| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            }),
            ..spec(sector(5, ProofType::StackedDrg2KiB), TaskType::PreCommit1)
        })
        .unwrap();
    started_rx.await.unwrap();

    // the single cpu is taken, so this one stays queued
    let task_b = sched
        .schedule(spec(sector(6, ProofType::StackedDrg2KiB), TaskType::PreCommit1))
        .unwrap();

    worker.restart();

    assert!(matches!(
        task_a.wait().await,
        Err(SchedError::SessionInvalidated)
    ));

    eventually("stale handle to be dropped", || {
        let sched = Arc::clone(&sched);
        async move { !sched.worker_stats().await.contains_key(&wid.0) }
    })
    .await;

    sched
        .run_worker(MockWorker::new("h2", "g1", 8, false))
        .await
        .unwrap();
    task_b.wait().await.unwrap();

    sched.close().await;
}

async fn max_work_concurrency(cpus: u64, remote_c2: bool, task_type: TaskType) -> usize {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    sched
        .run_worker(MockWorker::new("h1", "g1", cpus, false))
        .await
        .unwrap();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for number in 1..=2 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(
            sched
                .schedule(TaskSpec {
                    remote_c2,
                    work: action(move |_, _| async move {
                        let now = current.fetch_add(1, Ordering::AcqRel) + 1;
                        peak.fetch_max(now, Ordering::AcqRel);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        current.fetch_sub(1, Ordering::AcqRel);
                        Ok(())
                    }),
                    ..spec(sector(number, ProofType::StackedDrg2KiB), task_type)
                })
                .unwrap(),
        );
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }

    sched.close().await;
    peak.load(Ordering::Acquire)
}

/// Boundary: one cpu serializes two unit-cost tasks.
#[tokio::test]
async fn test_single_cpu_serializes_work() {
    assert_eq!(
        max_work_concurrency(1, false, TaskType::PreCommit1).await,
        1
    );
}

/// Boundary: two cpus run two unit-cost tasks concurrently.
#[tokio::test]
async fn test_two_cpus_overlap_work() {
    assert_eq!(
        max_work_concurrency(2, false, TaskType::PreCommit1).await,
        2
    );
}

/// Boundary: remote commit2 bypasses reservations entirely.
#[tokio::test]
async fn test_remote_c2_ignores_reservations() {
    assert_eq!(max_work_concurrency(1, true, TaskType::Commit2).await, 2);
}

/// Round-trip: moving a worker's group rewrites its info, its group list
/// membership and what try_sched reports.
#[tokio::test]
async fn test_set_worker_param_moves_group() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    let worker = MockWorker::new("h1", "g1", 8, false);
    let wid = sched.run_worker(worker.clone()).await.unwrap();

    assert!(sched.try_sched("g1", "2KiB").await.unwrap());

    sched
        .set_worker_param(&wid.to_string(), "group", "g2")
        .await
        .unwrap();

    let stats = sched.worker_stats().await;
    assert_eq!(stats.get(&wid.0).unwrap().info.group, "g2");
    assert_eq!(
        worker.params.lock().get("group").map(String::as_str),
        Some("g2")
    );

    assert!(sched.try_sched("g2", "2KiB").await.unwrap());
    // g1 is empty now, which is an error rather than a plain no
    assert!(matches!(
        sched.try_sched("g1", "2KiB").await,
        Err(SchedError::GroupUnschedulable(_))
    ));

    sched.close().await;
}

/// Cancelling an in-flight task aborts its current phase, frees its
/// reservations and leaves the worker usable.
#[tokio::test]
async fn test_cancel_is_observed_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    sched
        .run_worker(MockWorker::new("h1", "g1", 1, false))
        .await
        .unwrap();

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let stuck = sched
        .schedule(TaskSpec {
            work: action(move |cancel, _| async move {
                let _ = started_tx.send(());
                cancel.cancelled().await;
                Err(SchedError::Cancelled)
            }),
            ..spec(sector(21, ProofType::StackedDrg2KiB), TaskType::PreCommit1)
        })
        .unwrap();

    started_rx.await.unwrap();
    stuck.cancel();
    assert!(matches!(stuck.wait().await, Err(SchedError::Cancelled)));

    // the single cpu came back, so the next task sails through
    sched
        .schedule(spec(sector(22, ProofType::StackedDrg2KiB), TaskType::PreCommit1))
        .unwrap()
        .wait()
        .await
        .unwrap();

    sched.close().await;
}

/// A worker that does not declare a sector's proof class never receives
/// its tasks, even when it is the only worker with free capacity.
#[tokio::test]
async fn test_worker_without_proof_support_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string(), "h2".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    sched
        .run_worker(MockWorker::with_proofs(
            "h1",
            "g1",
            8,
            false,
            &[ProofType::StackedDrg2KiB],
        ))
        .await
        .unwrap();

    let ran_on: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let slot = Arc::clone(&ran_on);
    let handle = sched
        .schedule(TaskSpec {
            work: action(move |_, rpc| async move {
                let host = rpc.info().await?.hostname;
                slot.lock().push(host);
                Ok(())
            }),
            ..spec(sector(31, ProofType::StackedDrg8MiB), TaskType::PreCommit1)
        })
        .unwrap();

    // give a broken admission path time to misplace the task
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ran_on.lock().is_empty());

    sched
        .run_worker(MockWorker::new("h2", "g1", 8, false))
        .await
        .unwrap();
    handle.wait().await.unwrap();
    assert_eq!(ran_on.lock().as_slice(), ["h2".to_string()]);

    sched.close().await;
}

/// A queued AddPiece keeps try_sched negative until it is cancelled.
#[tokio::test]
async fn test_try_sched_blocked_by_queued_addpiece() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    sched
        .run_worker(MockWorker::new("h1", "g1", 8, false))
        .await
        .unwrap();

    let parked = sched
        .schedule(TaskSpec {
            group: Some("g1".to_string()),
            selector: Arc::new(NoWorker),
            ..spec(sector(9, ProofType::StackedDrg2KiB), TaskType::AddPiece)
        })
        .unwrap();

    eventually("addpiece to show up in the queue", || {
        let sched = Arc::clone(&sched);
        async move { !sched.try_sched("all", "2KiB").await.unwrap() }
    })
    .await;
    assert!(!sched.try_sched("g1", "2KiB").await.unwrap());

    parked.cancel();
    assert!(matches!(parked.wait().await, Err(SchedError::Cancelled)));

    eventually("queue to clear after cancel", || {
        let sched = Arc::clone(&sched);
        async move { sched.try_sched("all", "2KiB").await.unwrap() }
    })
    .await;

    sched.close().await;
}

/// A failing prepare frees its reservation, reports the error and leaves
/// the worker usable.
#[tokio::test]
async fn test_prepare_failure_frees_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    let worker = MockWorker::new("h1", "g1", 1, false);
    sched.run_worker(worker.clone()).await.unwrap();

    let failed = sched
        .schedule(TaskSpec {
            prepare: action(|_, _| async { Err(SchedError::Rpc("no space left".to_string())) }),
            ..spec(sector(3, ProofType::StackedDrg2KiB), TaskType::PreCommit1)
        })
        .unwrap();

    match failed.wait().await {
        Err(SchedError::PrepareFailed(msg)) => assert!(msg.contains("no space left")),
        other => panic!("expected prepare failure, got {:?}", other.err()),
    }
    assert!(
        worker
            .deleted
            .lock()
            .iter()
            .any(|(s, t)| s.number == 3 && *t == TaskType::PreCommit1)
    );

    // the prepare slot was freed; the next task sails through
    sched
        .schedule(spec(sector(4, ProofType::StackedDrg2KiB), TaskType::PreCommit1))
        .unwrap()
        .wait()
        .await
        .unwrap();

    sched.close().await;
}

/// Closure answers queued requests and refuses new ones.
#[tokio::test]
async fn test_close_answers_pending_and_rejects_new() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(OpenIndex {
        hosts: vec!["h1".to_string()],
    });
    let sched = Scheduler::new(config(&dir), index).unwrap();
    sched
        .run_worker(MockWorker::new("h1", "g1", 8, false))
        .await
        .unwrap();

    let parked = sched
        .schedule(TaskSpec {
            selector: Arc::new(NoWorker),
            ..spec(sector(11, ProofType::StackedDrg2KiB), TaskType::PreCommit1)
        })
        .unwrap();

    sched.close().await;

    assert!(matches!(
        parked.wait().await,
        Err(SchedError::SchedulerClosed)
    ));
    assert!(matches!(
        sched.schedule(spec(sector(12, ProofType::StackedDrg2KiB), TaskType::PreCommit1)),
        Err(SchedError::SchedulerClosed)
    ));
}
