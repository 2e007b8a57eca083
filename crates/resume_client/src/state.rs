use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};
use workspace_model::{lock_unpoisoned, BufferStore, WorkspaceModel};
use workspace_store::{PersistenceManager, StoreError};

/// Model and buffers shared by the coordinator, the runtime and the UI.
///
/// Locks are held only for short synchronous sections, never across an `.await`.
/// When both are needed, lock the model first.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    model: Arc<Mutex<WorkspaceModel>>,
    buffers: Arc<Mutex<BufferStore>>,
}

impl ClientState {
    #[must_use]
    pub fn new(model: WorkspaceModel, buffers: BufferStore) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            buffers: Arc::new(Mutex::new(buffers)),
        }
    }

    pub fn model(&self) -> MutexGuard<'_, WorkspaceModel> {
        lock_unpoisoned(&self.model)
    }

    pub fn buffers(&self) -> MutexGuard<'_, BufferStore> {
        lock_unpoisoned(&self.buffers)
    }

    /// Writes every pending model and buffer change.
    ///
    /// Changes that fail to persist are queued again for the next flush, except
    /// writes that still exceed the storage quota after eviction; those are
    /// dropped. Records evicted along the way are removed from memory too.
    pub fn flush(&self, persistence: &PersistenceManager) -> Result<(), StoreError> {
        let result = self.write_pending(persistence);
        self.apply_evictions(persistence);
        result
    }

    fn write_pending(&self, persistence: &PersistenceManager) -> Result<(), StoreError> {
        {
            let mut model = self.model();
            let dirty = model.take_dirty();
            if !dirty.is_empty() {
                if let Err(error) = persistence.save_changes(&model, &dirty) {
                    if error.is_quota_exceeded() {
                        warn!(%error, "dropping workspace changes that do not fit in storage");
                    } else {
                        model.requeue_dirty(dirty);
                    }
                    return Err(error);
                }
            }
        }

        let mut buffers = self.buffers();
        let dirty = buffers.take_dirty();
        if !dirty.is_empty() {
            if let Err(error) = persistence.persist_buffers(&buffers, &dirty) {
                if error.is_quota_exceeded() {
                    warn!(%error, "dropping buffer changes that do not fit in storage");
                } else {
                    buffers.requeue_dirty(dirty);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn apply_evictions(&self, persistence: &PersistenceManager) {
        let report = persistence.take_evicted();
        if report.is_empty() {
            return;
        }
        {
            let mut model = self.model();
            for id in &report.workspaces {
                if model.evict_workspace(id) {
                    debug!(workspace_id = %id, "dropped evicted workspace from memory");
                }
            }
        }
        let mut buffers = self.buffers();
        for session_id in &report.buffers {
            buffers.discard(session_id);
        }
    }
}
