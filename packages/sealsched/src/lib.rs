//! Window-based scheduler for sector sealing tasks.
//!
//! Producers submit [`TaskSpec`]s; the [`Scheduler`] packs them into bounded
//! scheduling windows offered by registered workers, honoring per-task
//! resource reservations, group locality and worker health. Worker loops
//! drive each window's tasks through prepare and work phases against an
//! opaque [`WorkerRpc`] transport.

pub mod config;
pub mod error;
pub mod group;
pub mod metrics;
pub mod resource;
pub mod sched;
mod sched_worker;
pub mod sector;
pub mod selector;
pub mod stats;
pub mod task;
pub mod window;
pub mod worker;

pub use config::SchedConfig;
pub use error::SchedError;
pub use group::GroupIndex;
pub use metrics::MetricsSnapshot;
pub use resource::{ResourceAccount, ResourceNeed, WorkerResources, task_cost};
pub use sched::Scheduler;
pub use sector::{ProofType, SectorId, SectorRef};
pub use selector::{
    AllocSelector, ExistingSelector, SectorFileType, StorageIndex, WorkerSelector,
};
pub use stats::{WorkerJob, WorkerStats};
pub use task::{CancelToken, TaskHandle, TaskSpec, TaskType, WorkerAction, action};
pub use window::{SchedWindow, WindowRequest};
pub use worker::{SessionStatus, WorkerHandle, WorkerId, WorkerInfo, WorkerParams, WorkerRpc};
