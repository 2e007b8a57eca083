//! Deterministic in-process terminal server speaking the `sync_protocol` contract.
//!
//! Session behavior is scripted per session id so tests and local runs can
//! exercise every reconnection path without a real server.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sync_protocol::{
    decode_client_frame, encode, Push, PushFrame, Request, RequestId, Response, ResponseFrame,
    SessionErrorCode, SessionInfo, Transport, TransportError, WorkspaceSummary, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use workspace_model::{lock_unpoisoned, EntryKind, SessionId, Workspace, WorkspaceId};

/// Stable transport identifier used for explicit startup selection.
pub const MOCK_TRANSPORT_ID: &str = "mock";

/// How the server answers requests about one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBehavior {
    /// Reconnects succeed.
    Live,
    /// Reconnects fail with `not_found`.
    Missing,
    /// The session exists but cannot be attached.
    Unattachable,
    /// Requests are never answered.
    Silent,
    /// Reconnects succeed after the given delay.
    Delayed(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MockServerError {
    #[error("client connection is closed")]
    Disconnected,
    #[error("failed to encode server frame: {0}")]
    Encode(String),
}

#[derive(Debug)]
struct ServerState {
    sessions: HashMap<SessionId, SessionBehavior>,
    unknown_sessions: SessionBehavior,
    workspaces: BTreeMap<WorkspaceId, Workspace>,
    protocol_version: u32,
    fail_session_create: bool,
    session_create_delay: Option<Duration>,
    next_session: u64,
    calls: Vec<Request>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            unknown_sessions: SessionBehavior::Missing,
            workspaces: BTreeMap::new(),
            protocol_version: PROTOCOL_VERSION,
            fail_session_create: false,
            session_create_delay: None,
            next_session: 1,
            calls: Vec::new(),
        }
    }
}

enum Reply {
    Now(Response),
    After(Duration, Response),
    Never,
}

/// In-process server. Cloning yields another handle to the same server.
#[derive(Debug, Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    client_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl MockServer {
    /// Returns the server and the receiver of frames destined for the client.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let server = Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            client_tx: Arc::new(Mutex::new(Some(client_tx))),
        };
        (server, client_rx)
    }

    pub fn set_session(&self, session_id: impl Into<SessionId>, behavior: SessionBehavior) {
        lock_unpoisoned(&self.state)
            .sessions
            .insert(session_id.into(), behavior);
    }

    /// Behavior for sessions never registered with [`Self::set_session`].
    pub fn set_unknown_session_behavior(&self, behavior: SessionBehavior) {
        lock_unpoisoned(&self.state).unknown_sessions = behavior;
    }

    #[must_use]
    pub fn session_behavior(&self, session_id: &SessionId) -> Option<SessionBehavior> {
        lock_unpoisoned(&self.state).sessions.get(session_id).copied()
    }

    pub fn insert_workspace(&self, workspace: Workspace) {
        lock_unpoisoned(&self.state)
            .workspaces
            .insert(workspace.id.clone(), workspace);
    }

    #[must_use]
    pub fn workspace(&self, workspace_id: &WorkspaceId) -> Option<Workspace> {
        lock_unpoisoned(&self.state)
            .workspaces
            .get(workspace_id)
            .cloned()
    }

    /// Frames are stamped with this version instead of the client's.
    pub fn set_protocol_version(&self, version: u32) {
        lock_unpoisoned(&self.state).protocol_version = version;
    }

    pub fn fail_session_create(&self, fail: bool) {
        lock_unpoisoned(&self.state).fail_session_create = fail;
    }

    pub fn set_session_create_delay(&self, delay: Option<Duration>) {
        lock_unpoisoned(&self.state).session_create_delay = delay;
    }

    /// Every request received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<Request> {
        lock_unpoisoned(&self.state).calls.clone()
    }

    #[must_use]
    pub fn call_count(&self, operation: &str) -> usize {
        lock_unpoisoned(&self.state)
            .calls
            .iter()
            .filter(|request| request.operation() == operation)
            .count()
    }

    /// Sessions currently answering reconnects.
    #[must_use]
    pub fn live_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<_> = lock_unpoisoned(&self.state)
            .sessions
            .iter()
            .filter(|(_, behavior)| matches!(behavior, SessionBehavior::Live))
            .map(|(id, _)| id.clone())
            .collect();
        sessions.sort();
        sessions
    }

    /// Emits a `terminal_output` push for a session.
    pub fn push_output(
        &self,
        session_id: &SessionId,
        chunk: impl Into<String>,
        kind: EntryKind,
    ) -> Result<(), MockServerError> {
        let version = lock_unpoisoned(&self.state).protocol_version;
        let frame = PushFrame {
            v: version,
            push: Push::TerminalOutput {
                session_id: session_id.clone(),
                chunk: chunk.into(),
                kind,
            },
        };
        let raw = encode(&frame).map_err(|error| MockServerError::Encode(error.to_string()))?;
        self.deliver(raw)
    }

    /// Drops the server end of the connection.
    pub fn disconnect(&self) {
        lock_unpoisoned(&self.client_tx).take();
    }

    fn deliver(&self, raw: String) -> Result<(), MockServerError> {
        let guard = lock_unpoisoned(&self.client_tx);
        let sender = guard.as_ref().ok_or(MockServerError::Disconnected)?;
        sender.send(raw).map_err(|_| MockServerError::Disconnected)
    }

    fn respond(&self, request_id: RequestId, response: Response) {
        let version = lock_unpoisoned(&self.state).protocol_version;
        let frame = ResponseFrame {
            v: version,
            request_id,
            response,
        };
        match encode(&frame) {
            Ok(raw) => {
                if self.deliver(raw).is_err() {
                    debug!(request_id, "client went away before the response");
                }
            }
            Err(error) => debug!(request_id, %error, "failed to encode mock response"),
        }
    }

    fn handle(&self, request: Request) -> Reply {
        let mut state = lock_unpoisoned(&self.state);
        state.calls.push(request.clone());

        match request {
            Request::SessionReconnect { session_id } => {
                let known = state.sessions.get(&session_id).copied();
                let behavior = match known {
                    Some(behavior) => behavior,
                    None => {
                        let behavior = state.unknown_sessions;
                        if behavior == SessionBehavior::Live {
                            state.sessions.insert(session_id.clone(), behavior);
                        }
                        behavior
                    }
                };
                let confirmed = Response::SessionData {
                    session: SessionInfo {
                        session_id,
                        title: None,
                    },
                };
                match behavior {
                    SessionBehavior::Live => Reply::Now(confirmed),
                    SessionBehavior::Delayed(delay) => Reply::After(delay, confirmed),
                    SessionBehavior::Silent => Reply::Never,
                    SessionBehavior::Missing => Reply::Now(session_error(
                        SessionErrorCode::NotFound,
                        "session does not exist",
                    )),
                    SessionBehavior::Unattachable => Reply::Now(session_error(
                        SessionErrorCode::Unattachable,
                        "session is owned by another client",
                    )),
                }
            }
            Request::SessionCreate { options } => {
                if state.fail_session_create {
                    return Reply::Now(session_error(
                        SessionErrorCode::Rejected,
                        "session limit reached",
                    ));
                }
                let session_id = SessionId::new(format!("mock-session-{}", state.next_session));
                state.next_session += 1;
                state.sessions.insert(session_id.clone(), SessionBehavior::Live);
                let created = Response::SessionData {
                    session: SessionInfo {
                        session_id,
                        title: options.title,
                    },
                };
                match state.session_create_delay {
                    Some(delay) => Reply::After(delay, created),
                    None => Reply::Now(created),
                }
            }
            Request::SessionClose { session_id } => match state.sessions.remove(&session_id) {
                Some(_) => Reply::Now(Response::Ack),
                None => Reply::Now(session_error(
                    SessionErrorCode::NotFound,
                    "session does not exist",
                )),
            },
            Request::WorkspaceCreate { name, layout } => {
                let workspace = Workspace::new(name, layout);
                state
                    .workspaces
                    .insert(workspace.id.clone(), workspace.clone());
                Reply::Now(Response::WorkspaceData { workspace })
            }
            Request::WorkspaceGet { workspace_id } => Reply::Now(
                match state.workspaces.get(&workspace_id) {
                    Some(workspace) => Response::WorkspaceData {
                        workspace: workspace.clone(),
                    },
                    None => workspace_missing(&workspace_id),
                },
            ),
            Request::WorkspaceList => Reply::Now(Response::WorkspaceListData {
                workspaces: state
                    .workspaces
                    .values()
                    .map(|workspace| WorkspaceSummary {
                        id: workspace.id.clone(),
                        name: workspace.name.clone(),
                        tab_count: workspace.tabs.len(),
                    })
                    .collect(),
            }),
            Request::WorkspaceUpdate {
                workspace_id,
                patch,
            } => Reply::Now(match state.workspaces.get_mut(&workspace_id) {
                Some(workspace) => {
                    patch.apply(workspace);
                    Response::WorkspaceData {
                        workspace: workspace.clone(),
                    }
                }
                None => workspace_missing(&workspace_id),
            }),
            Request::WorkspaceDelete { workspace_id } => {
                Reply::Now(match state.workspaces.remove(&workspace_id) {
                    Some(_) => Response::Ack,
                    None => workspace_missing(&workspace_id),
                })
            }
        }
    }
}

impl Transport for MockServer {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        let frame = decode_client_frame(&frame)
            .map_err(|error| TransportError::new(format!("mock server rejected frame: {error}")))?;
        let request_id = frame.request_id;

        match self.handle(frame.request) {
            Reply::Now(response) => self.respond(request_id, response),
            Reply::After(delay, response) => {
                let server = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    server.respond(request_id, response);
                });
            }
            Reply::Never => debug!(request_id, "mock server leaving request unanswered"),
        }
        Ok(())
    }
}

fn session_error(code: SessionErrorCode, message: &str) -> Response {
    Response::SessionError {
        code,
        message: message.to_string(),
    }
}

fn workspace_missing(workspace_id: &WorkspaceId) -> Response {
    Response::WorkspaceError {
        error: format!("workspace '{workspace_id}' does not exist"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use sync_protocol::{ClientConfig, SyncClient, SyncError};
    use workspace_model::WorkspaceLayout;

    use super::*;

    fn connect(server: &MockServer, rx: mpsc::UnboundedReceiver<String>) -> SyncClient {
        let (client, _pushes) =
            SyncClient::connect(Arc::new(server.clone()), rx, ClientConfig::default());
        client
    }

    #[tokio::test]
    async fn scripted_sessions_answer_reconnects() {
        let (server, rx) = MockServer::new();
        server.set_session("S1", SessionBehavior::Live);
        server.set_session("S2", SessionBehavior::Unattachable);
        let client = connect(&server, rx);

        assert!(client.session_reconnect(&SessionId::new("S1")).await.is_ok());
        assert_matches!(
            client.session_reconnect(&SessionId::new("S2")).await,
            Err(SyncError::SessionUnattachable { .. })
        );
        assert_matches!(
            client.session_reconnect(&SessionId::new("unknown")).await,
            Err(SyncError::SessionNotFound(_))
        );
        assert_eq!(server.call_count("session_reconnect"), 3);
    }

    #[tokio::test]
    async fn unknown_sessions_can_be_adopted_as_live() {
        let (server, rx) = MockServer::new();
        server.set_unknown_session_behavior(SessionBehavior::Live);
        let client = connect(&server, rx);

        let session = SessionId::new("from-last-run");
        assert!(client.session_reconnect(&session).await.is_ok());
        assert_eq!(server.live_sessions(), vec![session]);
    }

    #[tokio::test]
    async fn created_sessions_become_live_and_close_removes_them() {
        let (server, rx) = MockServer::new();
        let client = connect(&server, rx);

        let created = client
            .session_create(Default::default())
            .await
            .expect("create");
        assert_eq!(server.live_sessions(), vec![created.session_id.clone()]);

        client.session_close(&created.session_id).await.expect("close");
        assert!(server.live_sessions().is_empty());
    }

    #[tokio::test]
    async fn workspace_crud_round_trips_through_the_server() {
        let (server, rx) = MockServer::new();
        let client = connect(&server, rx);

        let created = client
            .workspace_create("remote", WorkspaceLayout::default())
            .await
            .expect("create");
        let renamed = client
            .workspace_update(&created.id, sync_protocol::WorkspacePatch::rename("renamed"))
            .await
            .expect("update");
        assert_eq!(renamed.name, "renamed");
        assert_eq!(client.workspace_list().await.expect("list").len(), 1);

        client.workspace_delete(&created.id).await.expect("delete");
        assert_matches!(
            client.workspace_get(&created.id).await,
            Err(SyncError::Workspace(_))
        );
    }
}
