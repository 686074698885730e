use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::SchedError;
use crate::resource::task_cost;
use crate::sched::Scheduler;
use crate::sector::{ProofType, SectorId};
use crate::selector::{AllocSelector, SectorFileType, WorkerSelector};
use crate::task::TaskType;
use crate::worker::{WorkerHandle, WorkerId, WorkerInfo, WorkerParams};

/// Point-in-time view of one worker for the surrounding service.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub info: WorkerInfo,
    pub enabled: bool,
    pub mem_used_min: u64,
    pub mem_used_max: u64,
    pub gpu_used: bool,
    pub cpu_use: u64,
    pub remote_c2: bool,
}

/// One job on a worker: running (`run_wait == 0`) or parked in the
/// 1-based `run_wait`'th window.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerJob {
    pub sector: SectorId,
    pub task_type: TaskType,
    pub run_wait: usize,
    pub start: DateTime<Utc>,
}

impl Scheduler {
    fn worker_handles(&self) -> Vec<(WorkerId, Arc<WorkerHandle>)> {
        self.workers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    pub async fn worker_stats(&self) -> HashMap<Uuid, WorkerStats> {
        let mut out = HashMap::new();
        for (wid, handle) in self.worker_handles() {
            let remote_c2 = match tokio::time::timeout(
                self.cfg.selector_timeout() * 2,
                handle.rpc.has_remote_c2(),
            )
            .await
            {
                Ok(Ok(supported)) => supported,
                Ok(Err(e)) => {
                    log::error!("querying remote-c2 support for {}: {}", wid, e);
                    false
                }
                Err(_) => {
                    log::error!("querying remote-c2 support for {} timed out", wid);
                    false
                }
            };

            let active = handle.active_snapshot();
            out.insert(
                wid.0,
                WorkerStats {
                    info: handle.info.read().clone(),
                    enabled: handle.is_enabled(),
                    mem_used_min: active.ram_min_used,
                    mem_used_max: active.ram_max_used,
                    gpu_used: active.gpu_used,
                    cpu_use: active.cpu_used,
                    remote_c2,
                },
            );
        }
        out
    }

    pub fn worker_jobs(&self) -> HashMap<Uuid, Vec<WorkerJob>> {
        let mut out = HashMap::new();
        for (wid, handle) in self.worker_handles() {
            let mut jobs = Vec::new();
            for job in handle.running.lock().iter() {
                jobs.push(WorkerJob {
                    sector: job.sector,
                    task_type: job.task_type,
                    run_wait: 0,
                    start: job.start,
                });
            }
            for (wi, window) in handle.windows.lock().iter().enumerate() {
                for request in &window.todo {
                    jobs.push(WorkerJob {
                        sector: request.sector.id,
                        task_type: request.task_type,
                        run_wait: wi + 1,
                        start: request.start,
                    });
                }
            }
            out.insert(wid.0, jobs);
        }
        out
    }

    /// Admin parameters of every live worker, keyed by worker id.
    pub async fn get_worker(&self) -> HashMap<String, WorkerParams> {
        let mut out = HashMap::new();
        for (wid, handle) in self.worker_handles() {
            match tokio::time::timeout(self.cfg.selector_timeout(), handle.rpc.worker_params())
                .await
            {
                Ok(Ok(params)) => {
                    out.insert(wid.to_string(), params);
                }
                Ok(Err(e)) => log::error!("reading params of worker {}: {}", wid, e),
                Err(_) => log::error!("reading params of worker {} timed out", wid),
            }
        }
        out
    }

    /// Push one admin parameter to a worker. Setting `group` also moves the
    /// worker between group lists and rewrites its cached info.
    pub async fn set_worker_param(
        &self,
        worker: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SchedError> {
        let id = Uuid::parse_str(worker)
            .map_err(|e| SchedError::InvalidParam(worker.to_string(), e.to_string()))?;
        let wid = WorkerId(id);
        let handle = self
            .workers
            .get(&wid)
            .map(|h| Arc::clone(h.value()))
            .ok_or(SchedError::WorkerNotFound(id))?;

        handle.rpc.set_worker_param(key, value).await?;

        if key == "group" {
            let old = {
                let mut info = handle.info.write();
                std::mem::replace(&mut info.group, value.to_string())
            };
            if old != value {
                self.groups.move_worker(&old, value, wid);
                log::info!("worker {} moved from group {} to {}", wid, old, value);
            }
        }
        Ok(())
    }

    pub fn get_sector_group(&self, sector: u64) -> Option<String> {
        self.groups.sector_group(sector)
    }

    pub fn update_sector_group(&self, sector: u64, group: &str) -> Result<(), SchedError> {
        self.groups.update_sector_group(sector, group)
    }

    pub fn delete_sector_group(&self, sector: u64) -> Result<(), SchedError> {
        self.groups.delete_sector_group(sector)
    }

    /// Could a PreCommit1 for `sector_size` land in `group` right now?
    /// `"all"` widens the probe to every group. Answers false while an
    /// AddPiece for the group is still waiting in the queue, so producers
    /// do not stack new sectors onto a saturated fleet; a group with no
    /// workers at all is an error rather than a plain no.
    pub async fn try_sched(&self, group: &str, sector_size: &str) -> Result<bool, SchedError> {
        let proof: ProofType = sector_size.parse()?;

        {
            let state = self.state.lock();
            for task in &state.queue {
                if task.task_type != TaskType::AddPiece {
                    continue;
                }
                if group == "all" || task.group.as_deref() == Some(group) {
                    log::debug!("try_sched: queued addpiece still waiting for {}", group);
                    return Ok(false);
                }
            }
        }

        let wids = if group == "all" {
            self.groups.all_workers()
        } else {
            self.groups.workers_in(group)
        };
        if wids.is_empty() {
            return Err(SchedError::GroupUnschedulable(group.to_string()));
        }

        let need = task_cost(TaskType::PreCommit1, proof);
        let selector = AllocSelector::new(
            Arc::clone(&self.index),
            SectorFileType::SEALED | SectorFileType::CACHE,
        );

        for wid in wids {
            let Some(handle) = self.workers.get(&wid).map(|h| Arc::clone(h.value())) else {
                log::error!("worker referenced by group list not found: {}", wid);
                continue;
            };
            if !handle.is_enabled() {
                log::debug!("try_sched: skipping disabled worker {}", wid);
                continue;
            }

            let (totals, supported) = {
                let info = handle.info.read();
                (
                    info.resources,
                    info.task_types.contains(&TaskType::PreCommit1)
                        && info.proof_types.contains(&proof),
                )
            };
            if !supported {
                continue;
            }
            if !handle.active_snapshot().can_handle(&need, &totals) {
                continue;
            }

            match tokio::time::timeout(
                self.cfg.selector_timeout(),
                selector.ok(TaskType::PreCommit1, proof, &handle),
            )
            .await
            {
                Ok(Ok(true)) => return Ok(true),
                Ok(Ok(false)) => continue,
                Ok(Err(e)) => {
                    log::warn!("try_sched selector error on {}: {}", wid, e);
                    continue;
                }
                Err(_) => continue,
            }
        }
        Ok(false)
    }
}
