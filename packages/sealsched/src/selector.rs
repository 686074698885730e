use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::error::SchedError;
use crate::sector::{ProofType, SectorId};
use crate::task::TaskType;
use crate::worker::WorkerHandle;

bitflags! {
    /// File classes a sector leaves on disk as it moves through sealing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectorFileType: u32 {
        const UNSEALED = 1;
        const SEALED = 2;
        const CACHE = 4;
        const UPDATE = 8;
    }
}

/// Admission filter: may this worker run this task? Selectors are pure with
/// respect to worker state at call time; the dispatcher re-queries on every
/// match pass. Declared task-type and proof-class support is checked by the
/// dispatcher itself, before the selector runs.
#[async_trait]
pub trait WorkerSelector: Send + Sync {
    async fn ok(
        &self,
        task_type: TaskType,
        proof_type: ProofType,
        worker: &WorkerHandle,
    ) -> Result<bool, SchedError>;
}

/// External view of where sector files live and where new ones fit, keyed
/// by worker hostname.
#[async_trait]
pub trait StorageIndex: Send + Sync {
    /// Hostnames currently holding the given file types for `sector`.
    async fn find_sector(
        &self,
        sector: SectorId,
        types: SectorFileType,
    ) -> Result<Vec<String>, SchedError>;

    /// Hostnames with a writable path that can take new files of `types`.
    async fn can_allocate(&self, types: SectorFileType) -> Result<Vec<String>, SchedError>;
}

/// Requires the worker to already hold the sector's files locally.
pub struct ExistingSelector {
    index: Arc<dyn StorageIndex>,
    sector: SectorId,
    types: SectorFileType,
}

impl ExistingSelector {
    pub fn new(index: Arc<dyn StorageIndex>, sector: SectorId, types: SectorFileType) -> Self {
        Self {
            index,
            sector,
            types,
        }
    }
}

#[async_trait]
impl WorkerSelector for ExistingSelector {
    async fn ok(
        &self,
        _task_type: TaskType,
        _proof_type: ProofType,
        worker: &WorkerHandle,
    ) -> Result<bool, SchedError> {
        let hostname = worker.info.read().hostname.clone();
        let holders = self.index.find_sector(self.sector, self.types).await?;
        Ok(holders.contains(&hostname))
    }
}

/// Accepts workers able to allocate the given file types. When built with a
/// sector and some worker already holds its files, only the holders pass,
/// keeping follow-up stages next to the data.
pub struct AllocSelector {
    index: Arc<dyn StorageIndex>,
    types: SectorFileType,
    sector: Option<SectorId>,
}

impl AllocSelector {
    pub fn new(index: Arc<dyn StorageIndex>, types: SectorFileType) -> Self {
        Self {
            index,
            types,
            sector: None,
        }
    }

    pub fn for_sector(
        index: Arc<dyn StorageIndex>,
        types: SectorFileType,
        sector: SectorId,
    ) -> Self {
        Self {
            index,
            types,
            sector: Some(sector),
        }
    }
}

#[async_trait]
impl WorkerSelector for AllocSelector {
    async fn ok(
        &self,
        _task_type: TaskType,
        _proof_type: ProofType,
        worker: &WorkerHandle,
    ) -> Result<bool, SchedError> {
        let hostname = worker.info.read().hostname.clone();
        let writable = self.index.can_allocate(self.types).await?;
        if !writable.contains(&hostname) {
            return Ok(false);
        }
        if let Some(sector) = self.sector {
            let holders = self.index.find_sector(sector, self.types).await?;
            if !holders.is_empty() && !holders.contains(&hostname) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
