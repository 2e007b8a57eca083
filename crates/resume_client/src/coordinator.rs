//! Startup restore and per-pane session reconciliation.
//!
//! Every pane bound to a session asks the server to reconnect it. Panes progress
//! independently: a confirmed session gets its cached output replayed, anything
//! else falls back to a fresh session exactly once. The pane is looked up again
//! before any result is applied, so panes closed mid-flight are never recreated.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use sync_protocol::{SessionOptions, SyncClient, SyncError};
use tracing::{debug, info, warn};
use workspace_model::{ModelError, PaneId, SessionId, WorkspaceId, WorkspaceModel};
use workspace_store::{LoadOutcome, NotFoundReason, PersistenceManager};

use crate::sink::{Banner, UiSink};
use crate::state::ClientState;

/// Why a pane could not keep its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    Unattachable(String),
    Timeout,
    ProtocolMismatch { found: u64 },
    Unreachable(String),
}

impl FailureReason {
    /// Whether the server confirmed the old session cannot come back.
    #[must_use]
    pub fn session_is_gone(&self) -> bool {
        matches!(self, Self::NotFound | Self::Unattachable(_))
    }

    fn from_error(error: &SyncError) -> Self {
        match error {
            SyncError::SessionNotFound(_) => Self::NotFound,
            SyncError::SessionUnattachable { message, .. } => Self::Unattachable(message.clone()),
            SyncError::Timeout { .. } => Self::Timeout,
            SyncError::ProtocolMismatch { found } => Self::ProtocolMismatch { found: *found },
            other => Self::Unreachable(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("session not found"),
            Self::Unattachable(message) => write!(f, "session unattachable: {message}"),
            Self::Timeout => f.write_str("request timed out"),
            Self::ProtocolMismatch { found } => write!(f, "protocol version {found} unsupported"),
            Self::Unreachable(detail) => write!(f, "server unreachable: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneOutcome {
    /// The server confirmed the session; cached output was replayed.
    Reconnected {
        session_id: SessionId,
        replayed: usize,
    },
    /// The pane now points at a new session.
    Recreated {
        previous: SessionId,
        session_id: SessionId,
        reason: FailureReason,
    },
    /// Neither reconnecting nor creating a session worked.
    ///
    /// The binding is kept unless the server said the old session is gone.
    Failed {
        previous: SessionId,
        reason: FailureReason,
        error: SyncError,
        kept_binding: bool,
    },
    /// The pane was closed or rebound while its requests were in flight.
    Discarded { session_id: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneReport {
    pub pane_id: PaneId,
    pub outcome: PaneOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    Storage,
    /// Storage had nothing usable; a default workspace was created.
    FreshDefault(NotFoundReason),
    /// A workspace activated after startup.
    Switch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub source: RestoreSource,
    pub workspace_id: Option<WorkspaceId>,
    /// One entry per bound pane, in display order.
    pub panes: Vec<PaneReport>,
    pub protocol_mismatch: Option<u64>,
}

impl RestoreReport {
    #[must_use]
    pub fn outcome(&self, pane_id: &PaneId) -> Option<&PaneOutcome> {
        self.panes
            .iter()
            .find(|report| &report.pane_id == pane_id)
            .map(|report| &report.outcome)
    }

    #[must_use]
    pub fn reconnected(&self) -> usize {
        self.count(|outcome| matches!(outcome, PaneOutcome::Reconnected { .. }))
    }

    #[must_use]
    pub fn recreated(&self) -> usize {
        self.count(|outcome| matches!(outcome, PaneOutcome::Recreated { .. }))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, PaneOutcome::Failed { .. }))
    }

    #[must_use]
    pub fn discarded(&self) -> usize {
        self.count(|outcome| matches!(outcome, PaneOutcome::Discarded { .. }))
    }

    /// True when panes needed the server and none of them got a session.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        let attempted = self.panes.len() - self.discarded();
        attempted > 0 && self.failed() == attempted
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let origin = match &self.source {
            RestoreSource::Storage => "restored from storage".to_string(),
            RestoreSource::FreshDefault(reason) => {
                format!("started with a default workspace ({})", describe_not_found(reason))
            }
            RestoreSource::Switch => "reconciled workspace".to_string(),
        };
        let mut summary = format!(
            "{origin}: {} panes, {} reconnected, {} recreated, {} failed, {} discarded",
            self.panes.len(),
            self.reconnected(),
            self.recreated(),
            self.failed(),
            self.discarded()
        );
        if self.is_offline() {
            summary.push_str(" (offline)");
        }
        summary
    }

    fn count(&self, predicate: impl Fn(&PaneOutcome) -> bool) -> usize {
        self.panes
            .iter()
            .filter(|report| predicate(&report.outcome))
            .count()
    }
}

fn describe_not_found(reason: &NotFoundReason) -> String {
    match reason {
        NotFoundReason::Empty => "nothing persisted".to_string(),
        NotFoundReason::Corrupt { key, .. } => format!("corrupt record {key}"),
        NotFoundReason::UnsupportedVersion { key, found } => {
            format!("{key} has unsupported version {found}")
        }
        NotFoundReason::NoUsableRecords => "no usable workspace records".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    Restoring,
    Reconnecting { pending: BTreeSet<PaneId> },
    Settled(RestoreReport),
}

enum Resolution {
    Confirmed {
        pane_id: PaneId,
        session_id: SessionId,
    },
    Created {
        pane_id: PaneId,
        previous: SessionId,
        session_id: SessionId,
        reason: FailureReason,
    },
    Failed {
        pane_id: PaneId,
        previous: SessionId,
        reason: FailureReason,
        error: SyncError,
    },
    Abandoned {
        pane_id: PaneId,
        session_id: SessionId,
    },
}

pub struct ReconnectionCoordinator {
    state: ClientState,
    persistence: Arc<PersistenceManager>,
    client: SyncClient,
    sink: Arc<dyn UiSink>,
    phase: RestoreState,
    reconciled: HashSet<WorkspaceId>,
}

impl ReconnectionCoordinator {
    pub fn new(
        state: ClientState,
        persistence: Arc<PersistenceManager>,
        client: SyncClient,
        sink: Arc<dyn UiSink>,
    ) -> Self {
        Self {
            state,
            persistence,
            client,
            sink,
            phase: RestoreState::Idle,
            reconciled: HashSet::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> &RestoreState {
        &self.phase
    }

    #[must_use]
    pub fn is_reconciled(&self, workspace_id: &WorkspaceId) -> bool {
        self.reconciled.contains(workspace_id)
    }

    /// Loads persisted state and reconciles the active workspace with the server.
    ///
    /// Never fails: unusable storage yields a fresh default workspace and an
    /// unreachable server leaves panes on their cached bindings.
    pub async fn restore(&mut self) -> RestoreReport {
        self.phase = RestoreState::Restoring;
        self.reconciled.clear();
        info!("restoring workspaces");

        let snapshot = match self.persistence.load() {
            LoadOutcome::Loaded(snapshot) => snapshot,
            LoadOutcome::NotFound(reason) => {
                info!(?reason, "no usable persisted state; creating a default workspace");
                let model = WorkspaceModel::with_default_workspace();
                let workspace_id = model.current_id().cloned();
                *self.state.model() = model;
                return self.settle(RestoreReport {
                    source: RestoreSource::FreshDefault(reason),
                    workspace_id,
                    panes: Vec::new(),
                    protocol_mismatch: None,
                });
            }
        };

        let mut model = snapshot.into_model();
        if model.current_id().is_none() {
            if let Some(first) = model.workspace_ids().into_iter().next() {
                if let Err(error) = model.activate_workspace(&first) {
                    warn!(%error, "could not activate a restored workspace");
                }
            }
        }
        let workspace_id = model.current_id().cloned();
        *self.state.model() = model;

        let panes = match &workspace_id {
            Some(workspace_id) => {
                self.load_buffers(workspace_id);
                self.reconcile_panes(workspace_id).await
            }
            None => Vec::new(),
        };
        let protocol_mismatch = protocol_mismatch(&panes);
        self.settle(RestoreReport {
            source: RestoreSource::Storage,
            workspace_id,
            panes,
            protocol_mismatch,
        })
    }

    /// Runs the per-pane protocol for a workspace activated after startup.
    pub async fn reconcile(
        &mut self,
        workspace_id: &WorkspaceId,
    ) -> Result<RestoreReport, ModelError> {
        let exists = self.state.model().workspace(workspace_id).is_some();
        if !exists {
            return Err(ModelError::WorkspaceNotFound(workspace_id.clone()));
        }

        self.load_buffers(workspace_id);
        let panes = self.reconcile_panes(workspace_id).await;
        let protocol_mismatch = protocol_mismatch(&panes);
        Ok(self.settle(RestoreReport {
            source: RestoreSource::Switch,
            workspace_id: Some(workspace_id.clone()),
            panes,
            protocol_mismatch,
        }))
    }

    /// Replaces in-memory buffers of the workspace's sessions with the stored copies.
    fn load_buffers(&self, workspace_id: &WorkspaceId) {
        let sessions = self.state.model().bound_panes(workspace_id);
        for (_, session_id) in sessions {
            if let Some(entries) = self.persistence.load_buffer(&session_id) {
                debug!(%session_id, entries = entries.len(), "loaded cached session buffer");
                self.state.buffers().load(&session_id, entries);
            }
        }
    }

    async fn reconcile_panes(&mut self, workspace_id: &WorkspaceId) -> Vec<PaneReport> {
        let panes = self.state.model().bound_panes(workspace_id);
        let order: Vec<PaneId> = panes.iter().map(|(pane_id, _)| pane_id.clone()).collect();
        self.phase = RestoreState::Reconnecting {
            pending: order.iter().cloned().collect(),
        };
        info!(%workspace_id, panes = panes.len(), "reconnecting sessions");

        let mut in_flight: FuturesUnordered<_> = panes
            .into_iter()
            .map(|(pane_id, session_id)| {
                resolve_pane(
                    self.client.clone(),
                    self.state.clone(),
                    workspace_id.clone(),
                    pane_id,
                    session_id,
                )
            })
            .collect();

        let mut reports = Vec::new();
        let mut orphans = Vec::new();
        while let Some(resolution) = in_flight.next().await {
            let report = self.apply(resolution, &mut orphans);
            if let RestoreState::Reconnecting { pending } = &mut self.phase {
                pending.remove(&report.pane_id);
            }
            reports.push(report);
        }

        for session_id in orphans {
            match self.client.session_close(&session_id).await {
                Ok(()) => debug!(%session_id, "closed session created for a closed pane"),
                Err(error) => warn!(%session_id, %error, "failed to close orphaned session"),
            }
        }

        reports.sort_by_key(|report| order.iter().position(|id| id == &report.pane_id));
        reports
    }

    fn apply(&self, resolution: Resolution, orphans: &mut Vec<SessionId>) -> PaneReport {
        match resolution {
            Resolution::Confirmed {
                pane_id,
                session_id,
            } => {
                let still_bound = self.binding_of(&pane_id) == Some(Some(session_id.clone()));
                if !still_bound {
                    debug!(%pane_id, %session_id, "pane changed while reconnecting; discarding");
                    return discarded(pane_id, session_id);
                }

                let entries = self.state.buffers().get(&session_id);
                self.sink.replay(&pane_id, &session_id, &entries);
                info!(%pane_id, %session_id, replayed = entries.len(), "session reconnected");
                PaneReport {
                    pane_id,
                    outcome: PaneOutcome::Reconnected {
                        session_id,
                        replayed: entries.len(),
                    },
                }
            }
            Resolution::Created {
                pane_id,
                previous,
                session_id,
                reason,
            } => {
                let rebound = {
                    let mut model = self.state.model();
                    let bound = model.pane(&pane_id).map(|pane| pane.bound_session().cloned());
                    match bound {
                        Some(Some(current)) if current == previous => {
                            model.rebind(&pane_id, session_id.clone()).is_ok()
                        }
                        _ => false,
                    }
                };
                if !rebound {
                    debug!(%pane_id, %session_id, "pane changed before its new session arrived");
                    orphans.push(session_id);
                    return discarded(pane_id, previous);
                }

                self.drop_buffer(&previous);
                info!(%pane_id, %previous, %session_id, %reason, "pane rebound to a new session");
                PaneReport {
                    pane_id,
                    outcome: PaneOutcome::Recreated {
                        previous,
                        session_id,
                        reason,
                    },
                }
            }
            Resolution::Failed {
                pane_id,
                previous,
                reason,
                error,
            } => {
                if self.binding_of(&pane_id).is_none() {
                    return discarded(pane_id, previous);
                }

                let mut kept_binding = true;
                if reason.session_is_gone() {
                    let unbound = {
                        let mut model = self.state.model();
                        let bound = model
                            .pane(&pane_id)
                            .and_then(|pane| pane.bound_session().cloned());
                        bound.as_ref() == Some(&previous) && model.unbind(&pane_id).is_ok()
                    };
                    if unbound {
                        kept_binding = false;
                        self.drop_buffer(&previous);
                    }
                }
                warn!(%pane_id, %previous, %reason, %error, "pane has no usable session");
                PaneReport {
                    pane_id,
                    outcome: PaneOutcome::Failed {
                        previous,
                        reason,
                        error,
                        kept_binding,
                    },
                }
            }
            Resolution::Abandoned {
                pane_id,
                session_id,
            } => discarded(pane_id, session_id),
        }
    }

    /// `None` when the pane no longer exists.
    fn binding_of(&self, pane_id: &PaneId) -> Option<Option<SessionId>> {
        self.state
            .model()
            .pane(pane_id)
            .map(|pane| pane.bound_session().cloned())
    }

    fn drop_buffer(&self, session_id: &SessionId) {
        self.state.buffers().clear(session_id);
        if let Err(error) = self.persistence.remove_buffer(session_id) {
            warn!(%session_id, %error, "failed to remove stale session buffer");
        }
    }

    fn settle(&mut self, report: RestoreReport) -> RestoreReport {
        if let Some(found) = report.protocol_mismatch {
            self.sink.banner(Banner::ProtocolMismatch { found });
        }
        if report.is_offline() {
            warn!("no pane could reach the terminal server");
            self.sink.banner(Banner::ServerUnreachable);
        }
        if let Err(error) = self.state.flush(&self.persistence) {
            warn!(%error, "failed to persist reconciled state");
        }
        if let Some(workspace_id) = &report.workspace_id {
            self.reconciled.insert(workspace_id.clone());
        }

        info!(summary = %report.summary(), "restore settled");
        self.phase = RestoreState::Settled(report.clone());
        report
    }
}

async fn resolve_pane(
    client: SyncClient,
    state: ClientState,
    workspace_id: WorkspaceId,
    pane_id: PaneId,
    session_id: SessionId,
) -> Resolution {
    let error = match client.session_reconnect(&session_id).await {
        Ok(_) => {
            return Resolution::Confirmed {
                pane_id,
                session_id,
            }
        }
        Err(error) => error,
    };

    let reason = FailureReason::from_error(&error);
    match reason {
        FailureReason::NotFound | FailureReason::Timeout => {
            debug!(%pane_id, %session_id, %reason, "reconnect failed; requesting a new session");
        }
        _ => warn!(%pane_id, %session_id, %error, "reconnect failed; requesting a new session"),
    }

    let pane_exists = state.model().pane(&pane_id).is_some();
    if !pane_exists {
        return Resolution::Abandoned {
            pane_id,
            session_id,
        };
    }

    match client
        .session_create(SessionOptions::for_pane(&workspace_id, &pane_id))
        .await
    {
        Ok(created) => Resolution::Created {
            pane_id,
            previous: session_id,
            session_id: created.session_id,
            reason,
        },
        Err(error) => Resolution::Failed {
            pane_id,
            previous: session_id,
            reason,
            error,
        },
    }
}

fn discarded(pane_id: PaneId, session_id: SessionId) -> PaneReport {
    PaneReport {
        pane_id,
        outcome: PaneOutcome::Discarded { session_id },
    }
}

fn protocol_mismatch(panes: &[PaneReport]) -> Option<u64> {
    panes.iter().find_map(|report| match &report.outcome {
        PaneOutcome::Recreated {
            reason: FailureReason::ProtocolMismatch { found },
            ..
        }
        | PaneOutcome::Failed {
            reason: FailureReason::ProtocolMismatch { found },
            ..
        } => Some(*found),
        _ => None,
    })
}
