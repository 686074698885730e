use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::SchedError;
use crate::worker::WorkerId;

/// Locality state: which group each sector's sealing is pinned to, and which
/// workers make up each group. The sector map survives restarts; worker
/// lists are rebuilt as workers re-register.
pub struct GroupIndex {
    path: PathBuf,
    state: Mutex<GroupState>,
}

#[derive(Default)]
struct GroupState {
    sector_group: HashMap<u64, String>,
    group_workers: HashMap<String, Vec<WorkerId>>,
}

impl GroupIndex {
    /// Load the sector map from `path`, or start empty if the file does not
    /// exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SchedError> {
        let path = path.into();
        let sector_group = match std::fs::read(&path) {
            Ok(bytes) => {
                let raw: HashMap<String, String> = serde_json::from_slice(&bytes)?;
                raw.into_iter()
                    .filter_map(|(k, v)| k.parse::<u64>().ok().map(|n| (n, v)))
                    .collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(GroupState {
                sector_group,
                group_workers: HashMap::new(),
            }),
        })
    }

    pub fn sector_group(&self, sector: u64) -> Option<String> {
        self.state.lock().sector_group.get(&sector).cloned()
    }

    /// Pin `sector` to `group` if it is unbound or bound elsewhere, flushing
    /// on change. Called when a task starts on a worker of that group.
    pub(crate) fn bind_sector(&self, sector: u64, group: &str) -> Result<(), SchedError> {
        let mut state = self.state.lock();
        match state.sector_group.get(&sector) {
            Some(current) if current == group => Ok(()),
            _ => {
                state.sector_group.insert(sector, group.to_string());
                self.flush_locked(&state)
            }
        }
    }

    /// Admin rebinding; errors when the sector is unknown or the group is
    /// already the current one.
    pub fn update_sector_group(&self, sector: u64, group: &str) -> Result<(), SchedError> {
        let mut state = self.state.lock();
        match state.sector_group.get(&sector) {
            None => Err(SchedError::SectorNotFound(sector)),
            Some(current) if current == group => {
                Err(SchedError::GroupUnchanged(sector, group.to_string()))
            }
            Some(_) => {
                state.sector_group.insert(sector, group.to_string());
                self.flush_locked(&state)
            }
        }
    }

    /// Drop a sector's binding. Missing entries are fine; a completed Fetch
    /// and an admin delete both land here.
    pub fn delete_sector_group(&self, sector: u64) -> Result<(), SchedError> {
        let mut state = self.state.lock();
        state.sector_group.remove(&sector);
        self.flush_locked(&state)
    }

    pub(crate) fn add_worker(&self, group: &str, wid: WorkerId) {
        let mut state = self.state.lock();
        state
            .group_workers
            .entry(group.to_string())
            .or_default()
            .push(wid);
    }

    /// Remove a worker from its group, dropping the group entry once empty.
    pub(crate) fn remove_worker(&self, group: &str, wid: WorkerId) {
        let mut state = self.state.lock();
        if let Some(list) = state.group_workers.get_mut(group) {
            list.retain(|w| *w != wid);
            if list.is_empty() {
                state.group_workers.remove(group);
            }
        }
    }

    pub(crate) fn move_worker(&self, old_group: &str, new_group: &str, wid: WorkerId) {
        let mut state = self.state.lock();
        if let Some(list) = state.group_workers.get_mut(old_group) {
            list.retain(|w| *w != wid);
            if list.is_empty() {
                state.group_workers.remove(old_group);
            }
        }
        state
            .group_workers
            .entry(new_group.to_string())
            .or_default()
            .push(wid);
    }

    pub fn workers_in(&self, group: &str) -> Vec<WorkerId> {
        self.state
            .lock()
            .group_workers
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_workers(&self) -> Vec<WorkerId> {
        self.state
            .lock()
            .group_workers
            .values()
            .flatten()
            .copied()
            .collect()
    }

    pub fn groups_of_worker(&self, wid: WorkerId) -> Vec<String> {
        self.state
            .lock()
            .group_workers
            .iter()
            .filter(|(_, list)| list.contains(&wid))
            .map(|(g, _)| g.clone())
            .collect()
    }

    pub fn flush(&self) -> Result<(), SchedError> {
        let state = self.state.lock();
        self.flush_locked(&state)
    }

    /// Atomic flush of the sector map: write a sibling temp file, then
    /// rename over the target. In-memory state is kept on failure so the
    /// caller can retry cheaply.
    fn flush_locked(&self, state: &GroupState) -> Result<(), SchedError> {
        let raw: BTreeMap<String, &str> = state
            .sector_group
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_str()))
            .collect();
        let data = serde_json::to_vec_pretty(&raw)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
