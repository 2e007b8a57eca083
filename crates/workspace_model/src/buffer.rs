//! Capped per-session output history.
//!
//! Invariant: a [`SessionBuffer`] never holds more than its capacity; appending to a
//! full buffer evicts exactly the oldest entry. Entries are never reordered.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::SessionId;

/// Maximum number of entries retained per session.
pub const MAX_LINES: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Input,
    Output,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferEntry {
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

impl BufferEntry {
    #[must_use]
    pub fn new(content: impl Into<String>, timestamp: OffsetDateTime, kind: EntryKind) -> Self {
        Self {
            content: content.into(),
            timestamp,
            kind,
        }
    }

    #[must_use]
    pub fn output_now(content: impl Into<String>) -> Self {
        Self::new(content, OffsetDateTime::now_utc(), EntryKind::Output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBuffer {
    entries: VecDeque<BufferEntry>,
    capacity: usize,
    last_activity: OffsetDateTime,
}

impl SessionBuffer {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            last_activity: OffsetDateTime::now_utc(),
        }
    }

    /// Appends in arrival order, evicting the oldest entry when full.
    ///
    /// Timestamps older than the newest retained entry are clamped forward so the
    /// buffer stays monotonic.
    pub fn push(&mut self, mut entry: BufferEntry) {
        if let Some(last) = self.entries.back() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }

        self.last_activity = entry.timestamp;
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &BufferEntry> + '_ {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn last_activity(&self) -> OffsetDateTime {
        self.last_activity
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<BufferEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// Changes recorded by a [`BufferStore`] since the last [`BufferStore::take_dirty`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferDirty {
    pub updated: BTreeSet<SessionId>,
    pub cleared: BTreeSet<SessionId>,
}

impl BufferDirty {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.cleared.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub session_count: usize,
    pub total_entries: usize,
    pub oldest_activity: Option<OffsetDateTime>,
}

/// In-memory buffers for every known session.
#[derive(Debug, Clone)]
pub struct BufferStore {
    buffers: HashMap<SessionId, SessionBuffer>,
    capacity: usize,
    dirty: BufferDirty,
}

impl Default for BufferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_LINES)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            capacity: capacity.max(1),
            dirty: BufferDirty::default(),
        }
    }

    pub fn append(&mut self, session_id: &SessionId, entry: BufferEntry) {
        let capacity = self.capacity;
        self.buffers
            .entry(session_id.clone())
            .or_insert_with(|| SessionBuffer::with_capacity(capacity))
            .push(entry);
        self.dirty.cleared.remove(session_id);
        self.dirty.updated.insert(session_id.clone());
    }

    /// Snapshot of a session's entries in arrival order.
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Vec<BufferEntry> {
        self.buffers
            .get(session_id)
            .map(SessionBuffer::to_vec)
            .unwrap_or_default()
    }

    /// Borrowing, finite view over a session's entries.
    pub fn entries<'a>(
        &'a self,
        session_id: &SessionId,
    ) -> impl Iterator<Item = &'a BufferEntry> + 'a {
        self.buffers
            .get(session_id)
            .into_iter()
            .flat_map(|buffer| buffer.iter())
    }

    #[must_use]
    pub fn len(&self, session_id: &SessionId) -> usize {
        self.buffers.get(session_id).map_or(0, SessionBuffer::len)
    }

    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.buffers.contains_key(session_id)
    }

    /// Removes every entry for a session. Returns whether a buffer existed.
    pub fn clear(&mut self, session_id: &SessionId) -> bool {
        let existed = self.buffers.remove(session_id).is_some();
        self.dirty.updated.remove(session_id);
        self.dirty.cleared.insert(session_id.clone());
        existed
    }

    /// Forgets a buffer whose stored copy was evicted, without queueing a delete.
    pub fn discard(&mut self, session_id: &SessionId) -> bool {
        self.dirty.updated.remove(session_id);
        self.dirty.cleared.remove(session_id);
        self.buffers.remove(session_id).is_some()
    }

    /// Replaces a session's buffer with a persisted copy.
    ///
    /// Only the newest `capacity` entries are kept. Loading does not mark the
    /// session dirty since the data came from storage.
    pub fn load(&mut self, session_id: &SessionId, entries: Vec<BufferEntry>) {
        let mut buffer = SessionBuffer::with_capacity(self.capacity);
        let skip = entries.len().saturating_sub(self.capacity);
        for entry in entries.into_iter().skip(skip) {
            buffer.push(entry);
        }
        self.buffers.insert(session_id.clone(), buffer);
    }

    pub fn session_ids(&self) -> impl Iterator<Item = &SessionId> {
        self.buffers.keys()
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            session_count: self.buffers.len(),
            total_entries: self.buffers.values().map(SessionBuffer::len).sum(),
            oldest_activity: self
                .buffers
                .values()
                .map(SessionBuffer::last_activity)
                .min(),
        }
    }

    /// Drops buffers whose last append is older than `ttl` relative to `now`.
    pub fn expire_idle(&mut self, now: OffsetDateTime, ttl: time::Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| now - buffer.last_activity() > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &expired {
            self.clear(session_id);
        }

        expired
    }

    /// Like [`Self::expire_idle`] but never drops the sessions in `keep`.
    pub fn expire_idle_except(
        &mut self,
        now: OffsetDateTime,
        ttl: time::Duration,
        keep: &HashSet<SessionId>,
    ) -> Vec<SessionId> {
        let mut expired: Vec<SessionId> = self
            .buffers
            .iter()
            .filter(|(id, buffer)| !keep.contains(*id) && now - buffer.last_activity() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for session_id in &expired {
            self.clear(session_id);
        }

        expired
    }

    /// Returns and resets the set of sessions changed since the previous call.
    pub fn take_dirty(&mut self) -> BufferDirty {
        std::mem::take(&mut self.dirty)
    }

    /// Puts back changes that could not be persisted.
    pub fn requeue_dirty(&mut self, dirty: BufferDirty) {
        for session_id in dirty.cleared {
            if !self.dirty.updated.contains(&session_id) {
                self.dirty.cleared.insert(session_id);
            }
        }
        for session_id in dirty.updated {
            if !self.dirty.cleared.contains(&session_id) {
                self.dirty.updated.insert(session_id);
            }
        }
    }
}
