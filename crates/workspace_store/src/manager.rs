//! Durable copy of the workspace model and session buffers.
//!
//! Loading never fails: unreadable, corrupt or version-mismatched state is logged
//! and reported as [`LoadOutcome::NotFound`]. Writes that run out of quota evict
//! the least recently used inactive workspaces and are retried exactly once.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workspace_model::{
    lock_unpoisoned, BufferDirty, BufferEntry, BufferStore, ModelDirty, SessionId, Workspace,
    WorkspaceId, WorkspaceModel,
};

use crate::error::StoreError;
use crate::keys::{buffer_key, workspace_key, StorageKey, CURRENT_KEY, INDEX_KEY};
use crate::kv::KeyValueStore;
use crate::schema::{
    decode_record, decode_stamp, encode_record, validate_buffer, validate_workspace,
    BufferRecord, CurrentRecord, IndexRecord, WorkspaceRecord, WriteStamp, SCHEMA_VERSION,
};

/// Workspaces recovered from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub workspaces: Vec<Workspace>,
    pub current: Option<WorkspaceId>,
    /// Index entries whose record was missing or unusable.
    pub skipped: Vec<WorkspaceId>,
}

impl Snapshot {
    #[must_use]
    pub fn into_model(self) -> WorkspaceModel {
        WorkspaceModel::from_snapshot(self.workspaces, self.current.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFoundReason {
    /// Nothing has been persisted yet.
    Empty,
    /// The index could not be read or parsed.
    Corrupt { key: String, detail: String },
    /// The index was written by an incompatible schema.
    UnsupportedVersion { key: String, found: u64 },
    /// The index exists but none of its workspace records are usable.
    NoUsableRecords,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(Snapshot),
    NotFound(NotFoundReason),
}

/// How far eviction shrinks storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub target_bytes: u64,
}

impl EvictionPolicy {
    /// Targets three quarters of the quota so the retried write has headroom.
    #[must_use]
    pub fn for_quota(quota: u64) -> Self {
        Self {
            target_bytes: quota / 4 * 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub workspaces: Vec<WorkspaceId>,
    pub buffers: Vec<SessionId>,
    pub usage_before: u64,
    pub usage_after: u64,
}

impl EvictionReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty() && self.buffers.is_empty()
    }

    fn absorb(&mut self, other: EvictionReport) {
        if self.is_empty() {
            self.usage_before = other.usage_before;
        }
        self.usage_after = other.usage_after;
        self.workspaces.extend(other.workspaces);
        self.buffers.extend(other.buffers);
    }
}

/// Records another writer changed since this manager last saw them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignChanges {
    pub updated: Vec<WorkspaceId>,
    pub removed: Vec<WorkspaceId>,
    pub current_changed: bool,
}

impl ForeignChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty() && !self.current_changed
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    revision: u64,
    /// Last stamp written or read per key.
    known_stamps: HashMap<String, WriteStamp>,
    /// Records removed by quota eviction since the last `take_evicted`.
    evicted: EvictionReport,
}

pub struct PersistenceManager {
    store: Arc<dyn KeyValueStore>,
    writer: String,
    state: Mutex<ManagerState>,
}

impl PersistenceManager {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_writer(store, format!("writer_{}", Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn with_writer(store: Arc<dyn KeyValueStore>, writer: impl Into<String>) -> Self {
        Self {
            store,
            writer: writer.into(),
            state: Mutex::new(ManagerState::default()),
        }
    }

    #[must_use]
    pub fn writer(&self) -> &str {
        &self.writer
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Writes every workspace, the index and the current pointer, and drops
    /// records of workspaces the model no longer has.
    pub fn save(&self, model: &WorkspaceModel) -> Result<(), StoreError> {
        let live: HashSet<WorkspaceId> = model.workspace_ids().into_iter().collect();
        if let Some(index) = self.read_index().ok().flatten() {
            for id in index.workspace_ids.iter().filter(|id| !live.contains(*id)) {
                self.remove_key(&workspace_key(id))?;
            }
        }

        for workspace in model.workspaces() {
            self.write_workspace(workspace, model.current_id())?;
        }
        self.write_index(model)?;
        self.write_current(model)?;
        Ok(())
    }

    /// Writes only the records named by `dirty`.
    pub fn save_changes(
        &self,
        model: &WorkspaceModel,
        dirty: &ModelDirty,
    ) -> Result<(), StoreError> {
        for id in &dirty.removed {
            self.remove_key(&workspace_key(id))?;
        }
        for id in &dirty.workspaces {
            match model.workspace(id) {
                Some(workspace) => self.write_workspace(workspace, model.current_id())?,
                None => {
                    self.remove_key(&workspace_key(id))?;
                }
            }
        }
        if dirty.index || !dirty.removed.is_empty() {
            self.write_index(model)?;
        }
        if dirty.current {
            self.write_current(model)?;
        }
        Ok(())
    }

    pub fn load(&self) -> LoadOutcome {
        let index = match self.read_index() {
            Ok(Some(index)) => index,
            Ok(None) => {
                debug!("no persisted workspace index");
                return LoadOutcome::NotFound(NotFoundReason::Empty);
            }
            Err(StoreError::UnsupportedVersion { key, found, .. }) => {
                warn!(%key, found, "persisted workspace index has unsupported schema version");
                return LoadOutcome::NotFound(NotFoundReason::UnsupportedVersion { key, found });
            }
            Err(error) => {
                warn!(%error, "persisted workspace index is unusable");
                return LoadOutcome::NotFound(NotFoundReason::Corrupt {
                    key: INDEX_KEY.to_string(),
                    detail: error.to_string(),
                });
            }
        };

        let mut workspaces = Vec::new();
        let mut skipped = Vec::new();
        let mut seen = HashSet::new();
        for id in index.workspace_ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.read_workspace(&id) {
                Ok(Some(workspace)) => workspaces.push(workspace),
                Ok(None) => {
                    warn!(workspace_id = %id, "indexed workspace record is missing");
                    skipped.push(id);
                }
                Err(error) => {
                    warn!(workspace_id = %id, %error, "skipping unusable workspace record");
                    skipped.push(id);
                }
            }
        }

        if workspaces.is_empty() && !skipped.is_empty() {
            return LoadOutcome::NotFound(NotFoundReason::NoUsableRecords);
        }
        if workspaces.is_empty() {
            return LoadOutcome::NotFound(NotFoundReason::Empty);
        }

        let current = match self.read_current() {
            Ok(current) => current,
            Err(error) => {
                warn!(%error, "ignoring unusable current workspace pointer");
                None
            }
        };

        info!(
            workspaces = workspaces.len(),
            skipped = skipped.len(),
            "loaded persisted workspaces"
        );
        LoadOutcome::Loaded(Snapshot {
            workspaces,
            current,
            skipped,
        })
    }

    pub fn save_buffer(
        &self,
        session_id: &SessionId,
        entries: &[BufferEntry],
    ) -> Result<(), StoreError> {
        let key = buffer_key(session_id);
        let record = BufferRecord {
            version: SCHEMA_VERSION,
            stamp: self.next_stamp(),
            session_id: session_id.clone(),
            entries: entries.to_vec(),
        };
        let protected = Protected {
            workspaces: self.stored_current().into_iter().collect(),
            session: Some(session_id.clone()),
        };
        self.write_record(&key, &record, &record.stamp, &protected)
    }

    /// Returns the persisted entries for a session; unusable records read as `None`.
    pub fn load_buffer(&self, session_id: &SessionId) -> Option<Vec<BufferEntry>> {
        let key = buffer_key(session_id);
        let raw = match self.store.get(&key) {
            Ok(raw) => raw?,
            Err(error) => {
                warn!(%key, %error, "failed to read session buffer");
                return None;
            }
        };

        match decode_record::<BufferRecord>(&key, &raw)
            .and_then(|record| validate_buffer(&key, session_id, &record).map(|()| record))
        {
            Ok(record) => Some(record.entries),
            Err(error) => {
                warn!(%key, %error, "ignoring unusable session buffer");
                None
            }
        }
    }

    pub fn remove_buffer(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.remove_key(&buffer_key(session_id))
    }

    /// Writes updated buffers and removes cleared ones.
    pub fn persist_buffers(
        &self,
        buffers: &BufferStore,
        dirty: &BufferDirty,
    ) -> Result<(), StoreError> {
        for session_id in &dirty.cleared {
            self.remove_buffer(session_id)?;
        }
        for session_id in &dirty.updated {
            self.save_buffer(session_id, &buffers.get(session_id))?;
        }
        Ok(())
    }

    /// Frees space by removing inactive workspaces, least recently accessed first,
    /// together with buffers no remaining workspace references, then orphaned
    /// buffers, until usage drops to the policy target.
    ///
    /// Eviction is local housekeeping and is never reported to the server.
    pub fn evict(
        &self,
        policy: EvictionPolicy,
        protected: &[WorkspaceId],
    ) -> Result<EvictionReport, StoreError> {
        let protected = Protected {
            workspaces: protected.iter().cloned().collect(),
            session: None,
        };
        self.evict_protected(policy, &protected)
    }

    /// Returns what quota-triggered eviction removed since the previous call.
    ///
    /// In-memory state still holding these records must drop them, otherwise
    /// the next save writes an index that points at missing records.
    #[must_use]
    pub fn take_evicted(&self) -> EvictionReport {
        std::mem::take(&mut lock_unpoisoned(&self.state).evicted)
    }

    /// Compares stored stamps against the ones this manager last saw.
    pub fn detect_foreign_writes(&self) -> Result<ForeignChanges, StoreError> {
        let keys = self.store.keys()?;
        let mut changes = ForeignChanges::default();
        let mut state = lock_unpoisoned(&self.state);

        let mut present = BTreeSet::new();
        for key in &keys {
            let Some(StorageKey::Workspace(id)) = StorageKey::parse(key) else {
                continue;
            };
            present.insert(key.clone());
            let Some(raw) = self.store.get(key)? else {
                continue;
            };
            let Ok(stamp) = decode_stamp(key, &raw) else {
                continue;
            };
            if stamp.writer != self.writer && state.known_stamps.get(key) != Some(&stamp) {
                changes.updated.push(id);
            }
        }

        state.known_stamps.retain(|key, _| {
            let Some(StorageKey::Workspace(id)) = StorageKey::parse(key) else {
                return true;
            };
            if present.contains(key) {
                return true;
            }
            changes.removed.push(id);
            false
        });

        if let Some(raw) = self.store.get(CURRENT_KEY)? {
            if let Ok(stamp) = decode_stamp(CURRENT_KEY, &raw) {
                changes.current_changed = stamp.writer != self.writer
                    && state.known_stamps.get(CURRENT_KEY) != Some(&stamp);
            }
        }

        changes.updated.sort();
        changes.removed.sort();
        Ok(changes)
    }

    /// Re-reads one workspace record, typically after [`Self::detect_foreign_writes`].
    pub fn reload_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        let workspace = self.read_workspace(id);
        if matches!(workspace, Ok(None)) {
            lock_unpoisoned(&self.state)
                .known_stamps
                .remove(&workspace_key(id));
        }
        workspace
    }

    /// Re-reads the current pointer written by another instance.
    pub fn reload_current(&self) -> Result<Option<WorkspaceId>, StoreError> {
        self.read_current()
    }

    fn evict_protected(
        &self,
        policy: EvictionPolicy,
        protected: &Protected,
    ) -> Result<EvictionReport, StoreError> {
        let usage_before = self.store.usage_bytes()?;
        let mut report = EvictionReport {
            usage_before,
            usage_after: usage_before,
            ..EvictionReport::default()
        };
        if usage_before <= policy.target_bytes {
            return Ok(report);
        }

        let mut candidates = Vec::new();
        let mut remaining: HashMap<WorkspaceId, Vec<SessionId>> = HashMap::new();
        let mut buffer_sessions = Vec::new();
        for key in self.store.keys()? {
            match StorageKey::parse(&key) {
                Some(StorageKey::Workspace(id)) => {
                    let workspace = self.read_workspace(&id).ok().flatten();
                    let sessions = workspace
                        .as_ref()
                        .map(Workspace::bound_sessions)
                        .unwrap_or_default();
                    let evictable = !protected.workspaces.contains(&id)
                        && workspace.as_ref().map_or(true, |ws| !ws.is_active);
                    if evictable {
                        // Unreadable records sort first.
                        let accessed = workspace.map(|ws| ws.last_accessed);
                        candidates.push((accessed, id.clone()));
                    }
                    remaining.insert(id, sessions);
                }
                Some(StorageKey::Buffer(session_id)) => buffer_sessions.push(session_id),
                _ => {}
            }
        }
        candidates.sort();

        let is_referenced =
            |remaining: &HashMap<WorkspaceId, Vec<SessionId>>, session: &SessionId| {
                protected.session.as_ref() == Some(session)
                    || remaining.values().any(|sessions| sessions.contains(session))
            };

        for (_, id) in candidates {
            if report.usage_after <= policy.target_bytes {
                break;
            }
            let sessions = remaining.remove(&id).unwrap_or_default();
            self.remove_key(&workspace_key(&id))?;
            for session in sessions {
                if !is_referenced(&remaining, &session) && self.remove_buffer(&session)? {
                    report.buffers.push(session);
                }
            }
            report.workspaces.push(id);
            report.usage_after = self.store.usage_bytes()?;
        }

        let mut orphans: Vec<(Option<OffsetDateTime>, SessionId)> = buffer_sessions
            .into_iter()
            .filter(|session| !report.buffers.contains(session))
            .filter(|session| !is_referenced(&remaining, session))
            .map(|session| {
                let written_at = self
                    .store
                    .get(&buffer_key(&session))
                    .ok()
                    .flatten()
                    .and_then(|raw| decode_stamp(&buffer_key(&session), &raw).ok())
                    .map(|stamp| stamp.written_at);
                (written_at, session)
            })
            .collect();
        orphans.sort();

        for (_, session) in orphans {
            if report.usage_after <= policy.target_bytes {
                break;
            }
            if self.remove_buffer(&session)? {
                report.buffers.push(session);
            }
            report.usage_after = self.store.usage_bytes()?;
        }

        if !report.workspaces.is_empty() {
            self.prune_index(&report.workspaces)?;
            report.usage_after = self.store.usage_bytes()?;
        }

        info!(
            workspaces = report.workspaces.len(),
            buffers = report.buffers.len(),
            usage_before = report.usage_before,
            usage_after = report.usage_after,
            "evicted persisted state"
        );
        Ok(report)
    }

    fn prune_index(&self, evicted: &[WorkspaceId]) -> Result<(), StoreError> {
        let Some(mut index) = self.read_index().ok().flatten() else {
            return Ok(());
        };
        index.workspace_ids.retain(|id| !evicted.contains(id));
        index.stamp = self.next_stamp();
        self.put_raw(INDEX_KEY, &encode_record(INDEX_KEY, &index)?, &index.stamp)
    }

    fn write_workspace(
        &self,
        workspace: &Workspace,
        current: Option<&WorkspaceId>,
    ) -> Result<(), StoreError> {
        let key = workspace_key(&workspace.id);
        let record = WorkspaceRecord {
            version: SCHEMA_VERSION,
            stamp: self.next_stamp(),
            workspace: workspace.clone(),
        };
        let protected = Protected {
            workspaces: current
                .into_iter()
                .cloned()
                .chain(std::iter::once(workspace.id.clone()))
                .collect(),
            session: None,
        };
        self.write_record(&key, &record, &record.stamp, &protected)
    }

    fn write_index(&self, model: &WorkspaceModel) -> Result<(), StoreError> {
        let record = IndexRecord {
            version: SCHEMA_VERSION,
            stamp: self.next_stamp(),
            workspace_ids: model.workspace_ids(),
        };
        let protected = Protected {
            workspaces: model.workspace_ids().into_iter().collect(),
            session: None,
        };
        self.write_record(INDEX_KEY, &record, &record.stamp, &protected)
    }

    fn write_current(&self, model: &WorkspaceModel) -> Result<(), StoreError> {
        let record = CurrentRecord {
            version: SCHEMA_VERSION,
            stamp: self.next_stamp(),
            workspace_id: model.current_id().cloned(),
        };
        let protected = Protected {
            workspaces: model.current_id().into_iter().cloned().collect(),
            session: None,
        };
        self.write_record(CURRENT_KEY, &record, &record.stamp, &protected)
    }

    fn write_record<T: serde::Serialize>(
        &self,
        key: &str,
        record: &T,
        stamp: &WriteStamp,
        protected: &Protected,
    ) -> Result<(), StoreError> {
        let raw = encode_record(key, record)?;
        match self.put_raw(key, &raw, stamp) {
            Err(StoreError::QuotaExceeded { limit, needed, .. }) => {
                warn!(%key, needed, limit, "storage quota exceeded; evicting before retry");
                let report = self.evict_protected(EvictionPolicy::for_quota(limit), protected)?;
                lock_unpoisoned(&self.state).evicted.absorb(report);
                self.put_raw(key, &raw, stamp)
            }
            other => other,
        }
    }

    fn put_raw(&self, key: &str, raw: &str, stamp: &WriteStamp) -> Result<(), StoreError> {
        self.store.put(key, raw)?;
        lock_unpoisoned(&self.state)
            .known_stamps
            .insert(key.to_string(), stamp.clone());
        Ok(())
    }

    fn remove_key(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.store.remove(key)?;
        lock_unpoisoned(&self.state).known_stamps.remove(key);
        Ok(removed)
    }

    fn read_index(&self) -> Result<Option<IndexRecord>, StoreError> {
        self.read_record::<IndexRecord>(INDEX_KEY)
            .map(|record| record.map(|(record, _)| record))
    }

    fn read_current(&self) -> Result<Option<WorkspaceId>, StoreError> {
        Ok(self
            .read_record::<CurrentRecord>(CURRENT_KEY)?
            .and_then(|(record, _)| record.workspace_id))
    }

    fn stored_current(&self) -> Option<WorkspaceId> {
        self.read_current().ok().flatten()
    }

    fn read_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        let key = workspace_key(id);
        let Some((record, _)) = self.read_record::<WorkspaceRecord>(&key)? else {
            return Ok(None);
        };
        validate_workspace(&key, id, &record.workspace)?;
        Ok(Some(record.workspace))
    }

    fn read_record<T>(&self, key: &str) -> Result<Option<(T, WriteStamp)>, StoreError>
    where
        T: serde::de::DeserializeOwned + Stamped,
    {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        let record: T = decode_record(key, &raw)?;
        let stamp = record.stamp().clone();
        lock_unpoisoned(&self.state)
            .known_stamps
            .insert(key.to_string(), stamp.clone());
        Ok(Some((record, stamp)))
    }

    fn next_stamp(&self) -> WriteStamp {
        let mut state = lock_unpoisoned(&self.state);
        state.revision += 1;
        WriteStamp::new(self.writer.clone(), state.revision)
    }
}

#[derive(Debug, Default)]
struct Protected {
    workspaces: HashSet<WorkspaceId>,
    session: Option<SessionId>,
}

trait Stamped {
    fn stamp(&self) -> &WriteStamp;
}

impl Stamped for WorkspaceRecord {
    fn stamp(&self) -> &WriteStamp {
        &self.stamp
    }
}

impl Stamped for IndexRecord {
    fn stamp(&self) -> &WriteStamp {
        &self.stamp
    }
}

impl Stamped for CurrentRecord {
    fn stamp(&self) -> &WriteStamp {
        &self.stamp
    }
}
