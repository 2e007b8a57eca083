use std::sync::Arc;

use pretty_assertions::assert_eq;
use termsync::store::Debouncer;
use termsync::{
    BufferEntry, LoadOutcome, MemoryStore, PersistenceManager, SessionId, SyncConfig,
    WorkspaceModel, MAX_LINES, PROTOCOL_VERSION,
};

#[test]
fn reexported_pieces_round_trip_a_workspace() {
    let mut model = WorkspaceModel::with_default_workspace();
    let workspace_id = model.current_id().cloned().expect("active workspace");
    model
        .create_tab(&workspace_id, "shell", Some(SessionId::new("S1")))
        .expect("tab");

    let persistence = PersistenceManager::new(Arc::new(MemoryStore::new()));
    persistence.save(&model).expect("save");
    persistence
        .save_buffer(&SessionId::new("S1"), &[BufferEntry::output_now("$ ls\r\n")])
        .expect("save buffer");

    let LoadOutcome::Loaded(snapshot) = persistence.load() else {
        panic!("saved state should load");
    };
    let restored = snapshot.into_model();
    assert_eq!(restored.current_id(), Some(&workspace_id));
    assert!(restored.is_session_visible(&SessionId::new("S1")));
    assert_eq!(
        persistence
            .load_buffer(&SessionId::new("S1"))
            .map(|entries| entries.len()),
        Some(1)
    );
}

#[test]
fn defaults_line_up_across_crates() {
    let config = SyncConfig::default();
    assert_eq!(config.persist_debounce, Debouncer::DEFAULT_WINDOW);
    assert_eq!(
        config.reconnect_timeout,
        termsync::protocol::DEFAULT_REQUEST_TIMEOUT
    );
    assert_eq!(MAX_LINES, 5000);
    assert_eq!(PROTOCOL_VERSION, 1);
}
