use std::sync::Arc;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::json;
use time::macros::datetime;
use workspace_model::{
    BufferEntry, BufferStore, EntryKind, LayoutKind, SessionId, SplitDirection, WorkspaceId,
    WorkspaceLayout, WorkspaceModel,
};
use workspace_store::{
    buffer_key, workspace_key, FileStore, KeyValueStore, LoadOutcome, MemoryStore,
    NotFoundReason, PersistenceManager, INDEX_KEY,
};

fn sample_model() -> (WorkspaceModel, WorkspaceId) {
    let mut model = WorkspaceModel::with_default_workspace();
    let ws = model.current_id().cloned().expect("default workspace is active");
    let (_, pane) = model
        .create_tab(&ws, "shell", Some(SessionId::new("S1")))
        .expect("tab");
    model
        .split_pane(&pane, SplitDirection::Vertical, Some(SessionId::new("S2")))
        .expect("split");
    model.create_workspace("scratch", WorkspaceLayout::new(LayoutKind::Grid));
    (model, ws)
}

fn manager(store: &MemoryStore, writer: &str) -> PersistenceManager {
    PersistenceManager::with_writer(Arc::new(store.clone()), writer)
}

fn loaded(outcome: LoadOutcome) -> workspace_store::Snapshot {
    match outcome {
        LoadOutcome::Loaded(snapshot) => snapshot,
        LoadOutcome::NotFound(reason) => panic!("expected a snapshot, got {reason:?}"),
    }
}

#[test]
fn save_then_load_round_trips_the_tree() {
    let store = MemoryStore::new();
    let (model, ws) = sample_model();
    manager(&store, "a").save(&model).expect("save");

    let snapshot = loaded(manager(&store, "b").load());

    assert_eq!(snapshot.current.as_ref(), Some(&ws));
    assert_eq!(snapshot.workspaces.len(), model.workspaces().len());
    for (restored, original) in snapshot.workspaces.iter().zip(model.workspaces()) {
        assert!(restored.same_tree(original), "{restored:?} != {original:?}");
    }
    assert!(snapshot.skipped.is_empty());
}

#[test]
fn file_store_round_trip_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (model, ws) = sample_model();
    {
        let store = FileStore::open(dir.path()).expect("open");
        PersistenceManager::new(Arc::new(store))
            .save(&model)
            .expect("save");
    }

    let store = FileStore::open(dir.path()).expect("reopen");
    let restored = loaded(PersistenceManager::new(Arc::new(store)).load()).into_model();
    assert_eq!(restored.current_id(), Some(&ws));
    assert_eq!(
        restored.bound_panes(&ws).len(),
        2,
        "both pane bindings must survive"
    );
}

#[test]
fn empty_storage_is_not_found() {
    let store = MemoryStore::new();
    assert_eq!(
        manager(&store, "a").load(),
        LoadOutcome::NotFound(NotFoundReason::Empty)
    );
}

#[test]
fn unknown_schema_version_is_not_found() {
    let store = MemoryStore::new();
    store
        .put(
            INDEX_KEY,
            &json!({ "version": 99, "layoutEngine": "v99" }).to_string(),
        )
        .expect("put");

    assert_matches!(
        manager(&store, "a").load(),
        LoadOutcome::NotFound(NotFoundReason::UnsupportedVersion { found: 99, .. })
    );
}

#[test]
fn garbage_index_is_not_found() {
    let store = MemoryStore::new();
    store.put(INDEX_KEY, "{{{{").expect("put");

    assert_matches!(
        manager(&store, "a").load(),
        LoadOutcome::NotFound(NotFoundReason::Corrupt { .. })
    );
}

#[test]
fn corrupt_workspace_record_is_skipped() {
    let store = MemoryStore::new();
    let (model, ws) = sample_model();
    manager(&store, "a").save(&model).expect("save");
    store.put(&workspace_key(&ws), "not json").expect("corrupt");

    let snapshot = loaded(manager(&store, "b").load());
    assert_eq!(snapshot.skipped, vec![ws]);
    assert_eq!(snapshot.workspaces.len(), 1);
}

#[test]
fn all_records_unusable_is_not_found() {
    let store = MemoryStore::new();
    let (model, _) = sample_model();
    manager(&store, "a").save(&model).expect("save");
    for id in model.workspace_ids() {
        store.remove(&workspace_key(&id)).expect("remove");
    }

    assert_eq!(
        manager(&store, "b").load(),
        LoadOutcome::NotFound(NotFoundReason::NoUsableRecords)
    );
}

#[test]
fn save_changes_drops_removed_workspaces() {
    let store = MemoryStore::new();
    let persistence = manager(&store, "a");
    let (mut model, _) = sample_model();
    let dirty = model.take_dirty();
    persistence.save_changes(&model, &dirty).expect("initial save");

    let scratch = model
        .workspaces()
        .iter()
        .find(|ws| !ws.is_active)
        .map(|ws| ws.id.clone())
        .expect("inactive workspace");
    model.remove_workspace(&scratch).expect("remove");
    let dirty = model.take_dirty();
    persistence.save_changes(&model, &dirty).expect("save changes");

    assert_eq!(store.get(&workspace_key(&scratch)).expect("get"), None);
    let snapshot = loaded(persistence.load());
    assert_eq!(snapshot.workspaces.len(), 1);
}

#[test]
fn buffers_round_trip_and_reject_mismatched_records() {
    let store = MemoryStore::new();
    let persistence = manager(&store, "a");
    let session = SessionId::new("S1");
    let entries = vec![
        BufferEntry::output_now("$ ls"),
        BufferEntry::output_now("Cargo.toml"),
    ];

    persistence.save_buffer(&session, &entries).expect("save");
    assert_eq!(persistence.load_buffer(&session), Some(entries.clone()));

    let other = SessionId::new("S2");
    let raw = store.get(&buffer_key(&session)).expect("get").expect("present");
    store.put(&buffer_key(&other), &raw).expect("copy under wrong key");
    assert_eq!(persistence.load_buffer(&other), None);

    assert!(persistence.remove_buffer(&session).expect("remove"));
    assert_eq!(persistence.load_buffer(&session), None);
}

#[test]
fn persist_buffers_follows_dirty_set() {
    let store = MemoryStore::new();
    let persistence = manager(&store, "a");
    let mut buffers = BufferStore::new();
    buffers.append(&SessionId::new("S1"), BufferEntry::output_now("one"));
    buffers.append(&SessionId::new("S2"), BufferEntry::output_now("two"));
    let dirty = buffers.take_dirty();
    persistence.persist_buffers(&buffers, &dirty).expect("persist");

    buffers.clear(&SessionId::new("S2"));
    let dirty = buffers.take_dirty();
    persistence.persist_buffers(&buffers, &dirty).expect("persist");

    assert!(persistence.load_buffer(&SessionId::new("S1")).is_some());
    assert!(persistence.load_buffer(&SessionId::new("S2")).is_none());
}

fn padded_entries(count: usize) -> Vec<BufferEntry> {
    (0..count)
        .map(|index| {
            BufferEntry::new(
                format!("{index:0>50}"),
                datetime!(2026-02-14 00:00 UTC),
                EntryKind::Output,
            )
        })
        .collect()
}

fn quota_fixture(store: &MemoryStore) -> (WorkspaceModel, WorkspaceId, WorkspaceId) {
    let mut model = WorkspaceModel::new();
    let old = model.create_workspace("old", WorkspaceLayout::default());
    model
        .create_tab(&old, "logs", Some(SessionId::new("OLD")))
        .expect("tab");
    let active = model.create_workspace("active", WorkspaceLayout::default());
    model
        .create_tab(&active, "shell", Some(SessionId::new("LIVE")))
        .expect("tab");
    model.activate_workspace(&active).expect("activate");

    let persistence = manager(store, "setup");
    persistence.save(&model).expect("save");
    let old_entries = padded_entries(200);
    persistence
        .save_buffer(&SessionId::new("OLD"), &old_entries)
        .expect("old buffer");
    (model, old, active)
}

#[test]
fn quota_exhaustion_evicts_inactive_workspace_and_retries() {
    let sizing = MemoryStore::new();
    quota_fixture(&sizing);
    let quota = sizing.usage_bytes().expect("usage") + 200;

    let store = MemoryStore::with_quota(quota);
    let (_, old, active) = quota_fixture(&store);
    let persistence = manager(&store, "writer");

    let live_entries = padded_entries(100);
    persistence
        .save_buffer(&SessionId::new("LIVE"), &live_entries)
        .expect("write succeeds after eviction");

    let evicted = persistence.take_evicted();
    assert_eq!(evicted.workspaces, vec![old.clone()]);
    assert_eq!(evicted.buffers, vec![SessionId::new("OLD")]);
    assert!(persistence.take_evicted().is_empty());

    assert_eq!(store.get(&workspace_key(&old)).expect("get"), None);
    assert_eq!(store.get(&buffer_key(&SessionId::new("OLD"))).expect("get"), None);
    assert!(store.get(&workspace_key(&active)).expect("get").is_some());
    assert_eq!(
        persistence.load_buffer(&SessionId::new("LIVE")).map(|e| e.len()),
        Some(100)
    );

    let snapshot = loaded(persistence.load());
    assert_eq!(snapshot.workspaces.len(), 1);
    assert_eq!(snapshot.workspaces[0].id, active);
}

#[test]
fn explicit_eviction_respects_protected_workspaces() {
    let store = MemoryStore::new();
    let (_, old, _) = quota_fixture(&store);
    let persistence = manager(&store, "writer");

    let report = persistence
        .evict(workspace_store::EvictionPolicy { target_bytes: 0 }, &[old.clone()])
        .expect("evict");

    assert!(!report.workspaces.contains(&old));
    assert!(store.get(&workspace_key(&old)).expect("get").is_some());
    assert!(report.usage_after <= report.usage_before);
}

#[test]
fn foreign_writes_are_detected_by_stamp() {
    let store = MemoryStore::new();
    let first = manager(&store, "tab-1");
    let second = manager(&store, "tab-2");
    let (mut model, ws) = sample_model();
    first.save(&model).expect("save");
    model.take_dirty();
    loaded(second.load());

    assert!(second.detect_foreign_writes().expect("detect").is_empty());

    model.rename_workspace(&ws, "renamed").expect("rename");
    let dirty = model.take_dirty();
    first.save_changes(&model, &dirty).expect("save changes");

    let changes = second.detect_foreign_writes().expect("detect");
    assert_eq!(changes.updated, vec![ws.clone()]);
    let reloaded = second
        .reload_workspace(&ws)
        .expect("reload")
        .expect("present");
    assert_eq!(reloaded.name, "renamed");
    assert!(second.detect_foreign_writes().expect("detect").is_empty());

    model.remove_workspace(&ws).expect("remove");
    let dirty = model.take_dirty();
    first.save_changes(&model, &dirty).expect("save changes");
    let changes = second.detect_foreign_writes().expect("detect");
    assert_eq!(changes.removed, vec![ws]);
    assert!(changes.current_changed);
}

#[test]
fn own_writes_are_not_foreign() {
    let store = MemoryStore::new();
    let persistence = manager(&store, "tab-1");
    let (model, _) = sample_model();
    persistence.save(&model).expect("save");

    assert!(persistence.detect_foreign_writes().expect("detect").is_empty());
}
