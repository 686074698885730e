use std::sync::Arc;

use tokio::sync::mpsc;

use crate::resource::{ResourceAccount, WorkerResources, task_cost};
use crate::task::TaskRequest;
use crate::worker::WorkerId;

/// A batch of tasks pre-allocated against one worker, delivered atomically.
///
/// Invariant: `allocated` equals the summed cost of every non-remote-c2
/// task in `todo`.
#[derive(Default)]
pub struct SchedWindow {
    pub allocated: ResourceAccount,
    pub todo: Vec<Arc<TaskRequest>>,
}

/// A worker's standing offer to accept one more window.
pub struct WindowRequest {
    pub worker: WorkerId,
    pub delivery: mpsc::Sender<SchedWindow>,
}

/// Move tasks from later windows into earlier ones that can still fit them,
/// then drop windows that ended up empty. Returns how many windows were
/// dropped so the caller can lower its outstanding request count.
///
/// Remote-c2 tasks move freely and touch no allocation on either side.
pub(crate) fn compact_windows(windows: &mut Vec<SchedWindow>, total: &WorkerResources) -> usize {
    if windows.len() > 1 {
        for hi in 1..windows.len() {
            let (before, after) = windows.split_at_mut(hi);
            let lower = &mut before[hi - 1];
            let higher = &mut after[0];

            let mut moved = Vec::new();
            for (ti, todo) in higher.todo.iter().enumerate() {
                let need = task_cost(todo.task_type, todo.sector.proof_type);

                if !todo.remote_c2 && !lower.allocated.can_handle(&need, total) {
                    continue;
                }

                moved.push(ti);
                lower.todo.push(Arc::clone(todo));

                if !todo.remote_c2 {
                    lower.allocated.add(&need);
                    higher.allocated.free(&need);
                }
            }

            for &ti in moved.iter().rev() {
                higher.todo.remove(ti);
            }
        }
    }

    let before = windows.len();
    windows.retain(|w| !w.todo.is_empty());
    before - windows.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::{ProofType, SectorId, SectorRef};
    use crate::task::{TaskSpec, TaskType};

    use async_trait::async_trait;

    struct AnyWorker;

    #[async_trait]
    impl crate::selector::WorkerSelector for AnyWorker {
        async fn ok(
            &self,
            _task_type: TaskType,
            _proof_type: ProofType,
            _worker: &crate::worker::WorkerHandle,
        ) -> Result<bool, crate::error::SchedError> {
            Ok(true)
        }
    }

    fn request(number: u64, task_type: TaskType, remote_c2: bool) -> Arc<TaskRequest> {
        let (poke, _poke_rx) = mpsc::channel(1);
        let spec = TaskSpec {
            sector: SectorRef {
                id: SectorId { miner: 1000, number },
                proof_type: ProofType::StackedDrg8MiB,
            },
            task_type,
            group: None,
            remote_c2,
            selector: Arc::new(AnyWorker),
            prepare: crate::task::action(|_, _| async { Ok(()) }),
            work: crate::task::action(|_, _| async { Ok(()) }),
        };
        let (req, _rx) = TaskRequest::new(spec, number, poke);
        req
    }

    fn window(tasks: Vec<Arc<TaskRequest>>) -> SchedWindow {
        let mut allocated = ResourceAccount::default();
        for t in &tasks {
            if !t.remote_c2 {
                allocated.add(&task_cost(t.task_type, t.sector.proof_type));
            }
        }
        SchedWindow {
            allocated,
            todo: tasks,
        }
    }

    fn totals(cpus: u64) -> WorkerResources {
        WorkerResources {
            cpus,
            gpu: true,
            ram: 256 << 30,
            ram_swap: 512 << 30,
        }
    }

    #[test]
    fn later_window_drains_into_earlier_one() {
        // One task in the front window, two in the back; all three fit the
        // worker, so compaction folds everything forward and drops a window.
        let mut windows = vec![
            window(vec![request(1, TaskType::PreCommit1, false)]),
            window(vec![
                request(2, TaskType::Fetch, false),
                request(3, TaskType::Finalize, false),
            ]),
        ];

        let dropped = compact_windows(&mut windows, &totals(3));

        assert_eq!(dropped, 1);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].todo.len(), 3);
        assert_eq!(windows[0].todo[0].sector.id.number, 1);
        assert_eq!(windows[0].todo[1].sector.id.number, 2);
        assert_eq!(windows[0].todo[2].sector.id.number, 3);
        assert_eq!(windows[0].allocated.cpu_used, 3);
    }

    #[test]
    fn tasks_that_do_not_fit_stay_behind() {
        let mut windows = vec![
            window(vec![request(1, TaskType::PreCommit1, false)]),
            window(vec![
                request(2, TaskType::Fetch, false),
                request(3, TaskType::Finalize, false),
            ]),
        ];

        // Room for exactly one extra cpu in the front window.
        let dropped = compact_windows(&mut windows, &totals(2));

        assert_eq!(dropped, 0);
        assert_eq!(windows[0].todo.len(), 2);
        assert_eq!(windows[1].todo.len(), 1);
        assert_eq!(windows[1].todo[0].sector.id.number, 3);
        assert_eq!(windows[1].allocated.cpu_used, 1);
    }

    #[test]
    fn remote_c2_moves_without_touching_allocations() {
        let mut windows = vec![
            window(vec![request(1, TaskType::PreCommit1, false)]),
            window(vec![request(2, TaskType::Commit2, true)]),
        ];

        // No headroom at all beyond the first task, yet the remote task
        // still folds forward.
        let dropped = compact_windows(&mut windows, &totals(1));

        assert_eq!(dropped, 1);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].todo.len(), 2);
        assert_eq!(windows[0].allocated.cpu_used, 1);
    }
}
