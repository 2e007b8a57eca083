#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use resume_client::{
    ClientRuntime, ClientState, RecordingSink, ReconnectionCoordinator, RuntimeHandle,
    RuntimeOptions,
};
use sync_protocol::{ClientConfig, Push, SyncClient};
use sync_protocol_mock::MockServer;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use workspace_model::{
    BufferEntry, EntryKind, PaneId, SessionId, SplitDirection, WorkspaceId, WorkspaceLayout,
    WorkspaceModel,
};
use workspace_store::{MemoryStore, PersistenceManager};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Fixture {
    pub server: MockServer,
    pub client: SyncClient,
    pub pushes: Option<mpsc::UnboundedReceiver<Push>>,
    pub store: Arc<MemoryStore>,
    pub persistence: Arc<PersistenceManager>,
    pub sink: RecordingSink,
    pub state: ClientState,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// A fresh client process over existing storage.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let (server, inbound) = MockServer::new();
        let (client, pushes) = SyncClient::connect(
            Arc::new(server.clone()),
            inbound,
            ClientConfig {
                request_timeout: REQUEST_TIMEOUT,
            },
        );
        let persistence = Arc::new(PersistenceManager::new(store.clone()));
        Self {
            server,
            client,
            pushes: Some(pushes),
            store,
            persistence,
            sink: RecordingSink::new(),
            state: ClientState::default(),
        }
    }

    pub fn coordinator(&self) -> ReconnectionCoordinator {
        ReconnectionCoordinator::new(
            self.state.clone(),
            Arc::clone(&self.persistence),
            self.client.clone(),
            Arc::new(self.sink.clone()),
        )
    }

    pub fn runtime(&mut self, options: RuntimeOptions) -> (ClientRuntime, RuntimeHandle) {
        let pushes = self.pushes.take().expect("runtime created once per fixture");
        ClientRuntime::new(
            self.state.clone(),
            Arc::clone(&self.persistence),
            self.client.clone(),
            pushes,
            Arc::new(self.sink.clone()),
            options,
        )
    }

    /// Persists one active workspace with a tab whose panes bind `sessions` in order.
    pub fn seed_workspace(&self, sessions: &[&str]) -> (WorkspaceId, Vec<PaneId>) {
        let mut model = WorkspaceModel::with_default_workspace();
        let workspace_id = model.current_id().cloned().expect("default workspace");
        let panes = add_tab(&mut model, &workspace_id, sessions);
        self.persistence.save(&model).expect("seed workspace");
        (workspace_id, panes)
    }

    pub fn seed_buffer(&self, session: &str, lines: &[&str]) {
        let entries: Vec<BufferEntry> = lines
            .iter()
            .enumerate()
            .map(|(offset, line)| entry_at(line, offset as i64))
            .collect();
        self.persistence
            .save_buffer(&SessionId::new(session), &entries)
            .expect("seed buffer");
    }

    pub fn binding(&self, pane_id: &PaneId) -> Option<SessionId> {
        self.state
            .model()
            .pane(pane_id)
            .and_then(|pane| pane.bound_session().cloned())
    }
}

/// Adds a tab to `workspace_id` with one pane per session, split horizontally.
pub fn add_tab(
    model: &mut WorkspaceModel,
    workspace_id: &WorkspaceId,
    sessions: &[&str],
) -> Vec<PaneId> {
    let mut sessions = sessions.iter();
    let first = sessions.next().map(|session| SessionId::new(*session));
    let (_, first_pane) = model
        .create_tab(workspace_id, "shell", first)
        .expect("create tab");
    let mut panes = vec![first_pane];
    for session in sessions {
        let last = panes.last().cloned().expect("at least one pane");
        let pane = model
            .split_pane(&last, SplitDirection::Horizontal, Some(SessionId::new(*session)))
            .expect("split pane");
        panes.push(pane);
    }
    panes
}

pub fn entry_at(content: &str, offset_secs: i64) -> BufferEntry {
    let base: OffsetDateTime = datetime!(2026-02-14 09:00 UTC);
    BufferEntry::new(
        content,
        base + time::Duration::seconds(offset_secs),
        EntryKind::Output,
    )
}

pub fn contents(entries: &[BufferEntry]) -> Vec<String> {
    entries.iter().map(|entry| entry.content.clone()).collect()
}

pub fn default_layout() -> WorkspaceLayout {
    WorkspaceLayout::default()
}
