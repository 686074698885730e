use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::sector::ProofType;
use crate::task::TaskType;

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// Total capacity a worker advertises at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResources {
    pub cpus: u64,
    pub gpu: bool,
    /// Physical memory in bytes
    pub ram: u64,
    /// Physical plus swap, in bytes
    pub ram_swap: u64,
}

/// Fixed cost of one task of a given type and proof class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNeed {
    pub cpu: u64,
    pub gpu: bool,
    pub ram_min: u64,
    pub ram_max: u64,
}

/// Running tally of reservations against one worker.
///
/// Each handle keeps two of these: `preparing` covers the prepare phase,
/// `active` covers the work phase. Every `add` must be paired with a `free`
/// on all exit paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceAccount {
    pub cpu_used: u64,
    pub gpu_used: bool,
    pub ram_min_used: u64,
    pub ram_max_used: u64,
}

impl ResourceAccount {
    /// Admission test: would `need` still fit under `total` on every dimension?
    pub fn can_handle(&self, need: &ResourceNeed, total: &WorkerResources) -> bool {
        if self.cpu_used + need.cpu > total.cpus {
            return false;
        }
        if self.ram_max_used + need.ram_max > total.ram {
            return false;
        }
        if self.ram_min_used + need.ram_min > total.ram_swap {
            return false;
        }
        if need.gpu && (self.gpu_used || !total.gpu) {
            return false;
        }
        true
    }

    pub fn add(&mut self, need: &ResourceNeed) {
        self.cpu_used += need.cpu;
        self.ram_min_used += need.ram_min;
        self.ram_max_used += need.ram_max;
        if need.gpu {
            self.gpu_used = true;
        }
    }

    pub fn free(&mut self, need: &ResourceNeed) {
        self.cpu_used = self.cpu_used.saturating_sub(need.cpu);
        self.ram_min_used = self.ram_min_used.saturating_sub(need.ram_min);
        self.ram_max_used = self.ram_max_used.saturating_sub(need.ram_max);
        if need.gpu {
            self.gpu_used = false;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ResourceAccount::default()
    }
}

static RESOURCE_TABLE: Lazy<HashMap<(TaskType, ProofType), ResourceNeed>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for pt in ProofType::ALL {
        let size = pt.sector_size();
        let large = size >= 16 * GIB;
        for tt in TaskType::ALL {
            let need = match tt {
                TaskType::AddPiece => ResourceNeed {
                    cpu: 1,
                    gpu: false,
                    ram_min: size,
                    ram_max: size,
                },
                TaskType::PreCommit1 | TaskType::Unseal | TaskType::ReplicaUpdate => {
                    ResourceNeed {
                        cpu: 1,
                        gpu: false,
                        ram_min: size * 3,
                        ram_max: size * 4,
                    }
                }
                TaskType::PreCommit2 => ResourceNeed {
                    cpu: 2,
                    gpu: large,
                    ram_min: size,
                    ram_max: size * 3 / 2,
                },
                TaskType::Commit1 => ResourceNeed {
                    cpu: 1,
                    gpu: false,
                    ram_min: GIB,
                    ram_max: GIB,
                },
                TaskType::Commit2 => ResourceNeed {
                    cpu: 2,
                    gpu: large,
                    ram_min: size * 2,
                    ram_max: size * 6,
                },
                TaskType::Fetch | TaskType::Finalize | TaskType::ReadPiece => ResourceNeed {
                    cpu: 1,
                    gpu: false,
                    ram_min: 64 * MIB,
                    ram_max: 128 * MIB,
                },
            };
            table.insert((tt, pt), need);
        }
    }
    table
});

/// Fixed cost of one task, indexed by task type and proof class.
pub fn task_cost(task_type: TaskType, proof_type: ProofType) -> ResourceNeed {
    // The table covers the full cross product, so the lookup cannot miss.
    RESOURCE_TABLE
        .get(&(task_type, proof_type))
        .copied()
        .unwrap_or(ResourceNeed {
            cpu: 1,
            gpu: false,
            ram_min: proof_type.sector_size(),
            ram_max: proof_type.sector_size(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals() -> WorkerResources {
        WorkerResources {
            cpus: 2,
            gpu: true,
            ram: 8 * GIB,
            ram_swap: 16 * GIB,
        }
    }

    #[test]
    fn admission_checks_every_dimension() {
        let total = totals();
        let mut acct = ResourceAccount::default();

        let need = ResourceNeed {
            cpu: 1,
            gpu: false,
            ram_min: 4 * GIB,
            ram_max: 4 * GIB,
        };
        assert!(acct.can_handle(&need, &total));
        acct.add(&need);
        assert!(acct.can_handle(&need, &total));
        acct.add(&need);
        // cpus exhausted
        assert!(!acct.can_handle(&need, &total));

        acct.free(&need);
        acct.free(&need);
        assert!(acct.is_empty());
    }

    #[test]
    fn gpu_is_exclusive_not_additive() {
        let total = totals();
        let mut acct = ResourceAccount::default();
        let need = ResourceNeed {
            cpu: 1,
            gpu: true,
            ram_min: GIB,
            ram_max: GIB,
        };

        assert!(acct.can_handle(&need, &total));
        acct.add(&need);
        assert!(acct.gpu_used);
        assert!(!acct.can_handle(&need, &total));

        acct.free(&need);
        assert!(!acct.gpu_used);
    }

    #[test]
    fn gpu_task_rejected_on_gpuless_worker() {
        let total = WorkerResources {
            gpu: false,
            ..totals()
        };
        let acct = ResourceAccount::default();
        let need = ResourceNeed {
            cpu: 1,
            gpu: true,
            ram_min: GIB,
            ram_max: GIB,
        };
        assert!(!acct.can_handle(&need, &total));
    }

    #[test]
    fn table_covers_all_task_and_proof_combinations() {
        for tt in TaskType::ALL {
            for pt in ProofType::ALL {
                let need = task_cost(tt, pt);
                assert!(need.cpu >= 1, "{:?}/{:?} has no cpu cost", tt, pt);
            }
        }
    }
}
