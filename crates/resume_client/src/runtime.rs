//! Client event loop.
//!
//! One task owns the loop: UI commands, server pushes, the persistence debounce
//! timer and the periodic cross-instance re-sync are handled in turn, so model
//! mutations never race each other.
//!
//! Workspace commands are applied locally first and then mirrored to the server.
//! Server failures are logged and never undo the local change.

use std::sync::Arc;
use std::time::Duration;

use sync_protocol::{Push, SessionOptions, SyncClient, SyncError, WorkspacePatch};
use termsync::SyncConfig;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use workspace_model::{
    BufferEntry, ModelError, PaneId, SessionId, SplitDirection, TabId, WorkspaceId,
    WorkspaceLayout,
};
use workspace_store::{Debouncer, PersistenceManager, StoreError};

use crate::coordinator::{ReconnectionCoordinator, RestoreReport};
use crate::sink::UiSink;
use crate::state::ClientState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub persist_debounce: Duration,
    pub resync_interval: Duration,
    pub buffer_ttl: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for RuntimeOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            persist_debounce: config.persist_debounce,
            resync_interval: config.resync_interval,
            buffer_ttl: config.buffer_ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    CreateWorkspace {
        name: String,
    },
    SwitchWorkspace {
        workspace_id: WorkspaceId,
    },
    RenameWorkspace {
        workspace_id: WorkspaceId,
        name: String,
    },
    DeleteWorkspace {
        workspace_id: WorkspaceId,
    },
    /// Opens a tab in the active workspace with a fresh session.
    CreateTab {
        title: String,
    },
    RenameTab {
        tab_id: TabId,
        title: String,
    },
    MoveTab {
        tab_id: TabId,
        index: usize,
    },
    CloseTab {
        tab_id: TabId,
    },
    SplitPane {
        pane_id: PaneId,
        direction: SplitDirection,
    },
    ClosePane {
        pane_id: PaneId,
    },
    /// Adopts server workspaces this client has not seen yet.
    PullWorkspaces,
    /// Persists pending changes now instead of waiting for the debounce.
    Flush,
}

impl UiCommand {
    fn mutates_model(&self) -> bool {
        !matches!(self, Self::Flush)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Done,
    Workspace(WorkspaceId),
    Tab { tab_id: TabId, pane_id: PaneId },
    Pane(PaneId),
    /// Carries the reconcile report the first time a workspace is shown.
    Switched(Option<RestoreReport>),
    /// Workspaces adopted from the server.
    Pulled(Vec<WorkspaceId>),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("client runtime has stopped")]
    Stopped,
    #[error("no workspace is active")]
    NoActiveWorkspace,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

type Reply = oneshot::Sender<Result<CommandOutcome, RuntimeError>>;

enum Control {
    Command { command: UiCommand, reply: Reply },
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable sender side of a running [`ClientRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command { command, .. } => f.debug_tuple("Command").field(command).finish(),
            Self::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl RuntimeHandle {
    pub async fn execute(&self, command: UiCommand) -> Result<CommandOutcome, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Control::Command { command, reply })
            .map_err(|_| RuntimeError::Stopped)?;
        response.await.map_err(|_| RuntimeError::Stopped)?
    }

    /// Flushes persistence and stops the loop.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (done, finished) = oneshot::channel();
        self.tx
            .send(Control::Shutdown { done })
            .map_err(|_| RuntimeError::Stopped)?;
        finished.await.map_err(|_| RuntimeError::Stopped)
    }
}

pub struct ClientRuntime {
    coordinator: ReconnectionCoordinator,
    state: ClientState,
    persistence: Arc<PersistenceManager>,
    client: SyncClient,
    sink: Arc<dyn UiSink>,
    pushes: mpsc::UnboundedReceiver<Push>,
    commands: mpsc::UnboundedReceiver<Control>,
    debouncer: Debouncer,
    options: RuntimeOptions,
}

impl ClientRuntime {
    pub fn new(
        state: ClientState,
        persistence: Arc<PersistenceManager>,
        client: SyncClient,
        pushes: mpsc::UnboundedReceiver<Push>,
        sink: Arc<dyn UiSink>,
        options: RuntimeOptions,
    ) -> (Self, RuntimeHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let coordinator = ReconnectionCoordinator::new(
            state.clone(),
            Arc::clone(&persistence),
            client.clone(),
            Arc::clone(&sink),
        );
        let runtime = Self {
            coordinator,
            state,
            persistence,
            client,
            sink,
            pushes,
            commands,
            debouncer: Debouncer::new(options.persist_debounce),
            options,
        };
        (runtime, RuntimeHandle { tx })
    }

    #[must_use]
    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Runs the startup restore. Call before [`Self::run`].
    pub async fn restore(&mut self) -> RestoreReport {
        self.coordinator.restore().await
    }

    /// Processes events until shutdown or until every [`RuntimeHandle`] is dropped,
    /// then flushes pending changes.
    pub async fn run(mut self) {
        let mut resync = tokio::time::interval_at(
            Instant::now() + self.options.resync_interval,
            self.options.resync_interval,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pushes_open = true;

        loop {
            let deadline = self.debouncer.deadline().map(Instant::from_std);
            tokio::select! {
                control = self.commands.recv() => match control {
                    Some(Control::Command { command, reply }) => {
                        let result = self.handle(command).await;
                        if reply.send(result).is_err() {
                            debug!("command issuer stopped waiting for the outcome");
                        }
                    }
                    Some(Control::Shutdown { done }) => {
                        self.flush();
                        let _ = done.send(());
                        info!("client runtime stopped");
                        return;
                    }
                    None => break,
                },
                push = self.pushes.recv(), if pushes_open => match push {
                    Some(push) => self.on_push(push),
                    None => {
                        warn!("server push stream closed");
                        pushes_open = false;
                    }
                },
                () = sleep_until(deadline) => {
                    if self.debouncer.fire(now()) {
                        self.flush();
                    }
                }
                _ = resync.tick() => self.resync(),
            }
        }

        self.flush();
        info!("client runtime stopped");
    }

    async fn handle(&mut self, command: UiCommand) -> Result<CommandOutcome, RuntimeError> {
        debug!(?command, "handling ui command");
        let mutates = command.mutates_model();
        let outcome = match command {
            UiCommand::CreateWorkspace { name } => {
                let id = match self
                    .client
                    .workspace_create(name.clone(), WorkspaceLayout::default())
                    .await
                {
                    Ok(mut workspace) => {
                        let id = workspace.id.clone();
                        workspace.is_active = false;
                        self.state.model().upsert_workspace(workspace);
                        id
                    }
                    Err(error) => {
                        warn!(%error, "server did not create the workspace; keeping it local");
                        self.state
                            .model()
                            .create_workspace(name, WorkspaceLayout::default())
                    }
                };
                CommandOutcome::Workspace(id)
            }
            UiCommand::SwitchWorkspace { workspace_id } => {
                self.state.model().activate_workspace(&workspace_id)?;
                let report = if self.coordinator.is_reconciled(&workspace_id) {
                    self.replay_workspace(&workspace_id);
                    None
                } else {
                    Some(self.coordinator.reconcile(&workspace_id).await?)
                };
                CommandOutcome::Switched(report)
            }
            UiCommand::RenameWorkspace { workspace_id, name } => {
                self.state
                    .model()
                    .rename_workspace(&workspace_id, name.clone())?;
                self.push_patch(&workspace_id, WorkspacePatch::rename(name))
                    .await;
                CommandOutcome::Done
            }
            UiCommand::DeleteWorkspace { workspace_id } => {
                let sessions = self.state.model().remove_workspace(&workspace_id)?;
                self.ensure_active_workspace();
                self.close_sessions(sessions).await;
                match self.client.workspace_delete(&workspace_id).await {
                    Ok(()) => debug!(%workspace_id, "workspace deleted on the server"),
                    Err(error) => {
                        warn!(%workspace_id, %error, "failed to delete workspace on the server");
                    }
                }
                CommandOutcome::Done
            }
            UiCommand::CreateTab { title } => {
                let workspace_id = self.state.model().current_id().cloned();
                let workspace_id = workspace_id.ok_or(RuntimeError::NoActiveWorkspace)?;
                let options = SessionOptions {
                    workspace_id: Some(workspace_id.clone()),
                    pane_id: None,
                    title: Some(title.clone()),
                };
                let session_id = self.open_session(options).await;
                let created = self
                    .state
                    .model()
                    .create_tab(&workspace_id, title, session_id.clone());
                match created {
                    Ok((tab_id, pane_id)) => {
                        self.push_tabs(&workspace_id).await;
                        CommandOutcome::Tab { tab_id, pane_id }
                    }
                    Err(error) => {
                        self.close_sessions(session_id.into_iter().collect()).await;
                        return Err(error.into());
                    }
                }
            }
            UiCommand::RenameTab { tab_id, title } => {
                let workspace_id = self.workspace_of_tab(&tab_id);
                self.state.model().rename_tab(&tab_id, title)?;
                self.push_tabs_of(workspace_id).await;
                CommandOutcome::Done
            }
            UiCommand::MoveTab { tab_id, index } => {
                let workspace_id = self.workspace_of_tab(&tab_id);
                self.state.model().move_tab(&tab_id, index)?;
                self.push_tabs_of(workspace_id).await;
                CommandOutcome::Done
            }
            UiCommand::CloseTab { tab_id } => {
                let workspace_id = self.workspace_of_tab(&tab_id);
                let sessions = self.state.model().close_tab(&tab_id)?;
                self.close_sessions(sessions).await;
                self.push_tabs_of(workspace_id).await;
                CommandOutcome::Done
            }
            UiCommand::SplitPane { pane_id, direction } => {
                let location = self.state.model().locate_pane(&pane_id);
                let location = location.ok_or_else(|| ModelError::PaneNotFound(pane_id.clone()))?;
                let options = SessionOptions::for_pane(&location.workspace_id, &pane_id);
                let session_id = self.open_session(options).await;
                let created = self
                    .state
                    .model()
                    .split_pane(&pane_id, direction, session_id.clone());
                match created {
                    Ok(created) => {
                        self.push_tabs(&location.workspace_id).await;
                        CommandOutcome::Pane(created)
                    }
                    Err(error) => {
                        // The pane went away while the session was being created.
                        self.close_sessions(session_id.into_iter().collect()).await;
                        return Err(error.into());
                    }
                }
            }
            UiCommand::ClosePane { pane_id } => {
                let location = self.state.model().locate_pane(&pane_id);
                let session_id = self.state.model().close_pane(&pane_id)?;
                self.close_sessions(session_id.into_iter().collect()).await;
                self.push_tabs_of(location.map(|location| location.workspace_id))
                    .await;
                CommandOutcome::Done
            }
            UiCommand::PullWorkspaces => CommandOutcome::Pulled(self.pull_workspaces().await?),
            UiCommand::Flush => {
                self.debouncer.take();
                self.state.flush(&self.persistence)?;
                CommandOutcome::Done
            }
        };

        if mutates {
            self.mark_changed();
        }
        Ok(outcome)
    }

    fn on_push(&mut self, push: Push) {
        match push {
            Push::TerminalOutput {
                session_id,
                chunk,
                kind,
            } => {
                let entry = BufferEntry::new(chunk, OffsetDateTime::now_utc(), kind);
                let visible = self.state.model().is_session_visible(&session_id);
                self.state.buffers().append(&session_id, entry.clone());
                if visible {
                    self.sink.render_output(&session_id, &entry);
                }
                self.mark_changed();
            }
        }
    }

    /// Applies records written by other instances and expires abandoned buffers.
    fn resync(&mut self) {
        self.expire_idle_buffers();

        let changes = match self.persistence.detect_foreign_writes() {
            Ok(changes) => changes,
            Err(error) => {
                warn!(%error, "failed to check for foreign writes");
                return;
            }
        };
        if changes.is_empty() {
            return;
        }

        let pending = {
            let mut model = self.state.model();
            for workspace_id in &changes.updated {
                match self.persistence.reload_workspace(workspace_id) {
                    Ok(Some(workspace)) => model.apply_foreign(workspace),
                    Ok(None) => {
                        model.forget_workspace(workspace_id);
                    }
                    Err(error) => {
                        warn!(%workspace_id, %error, "ignoring unreadable foreign workspace");
                    }
                }
            }
            for workspace_id in &changes.removed {
                model.forget_workspace(workspace_id);
            }
            model.has_pending_changes()
        };
        if changes.current_changed {
            // Each instance keeps its own active workspace; record the new stamp.
            if let Err(error) = self.persistence.reload_current() {
                warn!(%error, "failed to read foreign current workspace pointer");
            }
        }

        info!(
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            current_changed = changes.current_changed,
            "applied changes from another instance"
        );
        if pending {
            self.mark_changed();
        }
    }

    fn expire_idle_buffers(&mut self) {
        let ttl = time::Duration::try_from(self.options.buffer_ttl).unwrap_or(time::Duration::MAX);
        let keep = self.state.model().all_bound_sessions();
        let expired = self
            .state
            .buffers()
            .expire_idle_except(OffsetDateTime::now_utc(), ttl, &keep);
        if !expired.is_empty() {
            debug!(sessions = expired.len(), "expired idle session buffers");
            self.mark_changed();
        }
    }

    fn replay_workspace(&self, workspace_id: &WorkspaceId) {
        let panes = self.state.model().bound_panes(workspace_id);
        for (pane_id, session_id) in panes {
            let entries = self.state.buffers().get(&session_id);
            self.sink.replay(&pane_id, &session_id, &entries);
        }
    }

    fn ensure_active_workspace(&self) {
        let mut model = self.state.model();
        if model.current_id().is_some() {
            return;
        }
        let next = model.workspace_ids().into_iter().next();
        let next = match next {
            Some(id) => id,
            None => model.create_workspace(
                workspace_model::Workspace::DEFAULT_NAME,
                WorkspaceLayout::default(),
            ),
        };
        if let Err(error) = model.activate_workspace(&next) {
            warn!(%error, "could not activate a replacement workspace");
        }
    }

    fn workspace_of_tab(&self, tab_id: &TabId) -> Option<WorkspaceId> {
        self.state
            .model()
            .workspaces()
            .iter()
            .find(|workspace| workspace.tabs.iter().any(|tab| &tab.id == tab_id))
            .map(|workspace| workspace.id.clone())
    }

    async fn push_tabs_of(&self, workspace_id: Option<WorkspaceId>) {
        if let Some(workspace_id) = workspace_id {
            self.push_tabs(&workspace_id).await;
        }
    }

    /// Sends the current tab tree of a workspace to the server.
    async fn push_tabs(&self, workspace_id: &WorkspaceId) {
        let tabs = match self.state.model().workspace(workspace_id) {
            Some(workspace) => workspace.tabs.clone(),
            None => return,
        };
        let patch = WorkspacePatch {
            tabs: Some(tabs),
            ..WorkspacePatch::default()
        };
        self.push_patch(workspace_id, patch).await;
    }

    async fn push_patch(&self, workspace_id: &WorkspaceId, patch: WorkspacePatch) {
        match self.client.workspace_update(workspace_id, patch).await {
            Ok(_) => debug!(%workspace_id, "workspace change sent to the server"),
            Err(SyncError::Workspace(error)) => {
                debug!(%workspace_id, %error, "server does not track this workspace");
            }
            Err(error) => warn!(%workspace_id, %error, "failed to send workspace change"),
        }
    }

    /// Fetches server workspaces missing from the model and adds them inactive.
    async fn pull_workspaces(&self) -> Result<Vec<WorkspaceId>, RuntimeError> {
        let summaries = self.client.workspace_list().await?;
        let mut pulled = Vec::new();
        for summary in summaries {
            if self.state.model().workspace(&summary.id).is_some() {
                continue;
            }
            match self.client.workspace_get(&summary.id).await {
                Ok(mut workspace) => {
                    workspace.is_active = false;
                    self.state.model().upsert_workspace(workspace);
                    pulled.push(summary.id);
                }
                Err(error) => {
                    warn!(workspace_id = %summary.id, %error, "failed to fetch server workspace");
                }
            }
        }
        if !pulled.is_empty() {
            info!(workspaces = pulled.len(), "adopted workspaces from the server");
        }
        Ok(pulled)
    }

    async fn open_session(&self, options: SessionOptions) -> Option<SessionId> {
        match self.client.session_create(options).await {
            Ok(created) => Some(created.session_id),
            Err(error) => {
                warn!(%error, "failed to create a session; pane starts unbound");
                None
            }
        }
    }

    async fn close_sessions(&self, sessions: Vec<SessionId>) {
        for session_id in sessions {
            self.state.buffers().clear(&session_id);
            if let Err(error) = self.client.session_close(&session_id).await {
                debug!(%session_id, %error, "failed to close session on the server");
            }
        }
    }

    fn mark_changed(&mut self) {
        self.debouncer.signal(now());
    }

    fn flush(&self) {
        if let Err(error) = self.state.flush(&self.persistence) {
            warn!(%error, "failed to persist client state");
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
