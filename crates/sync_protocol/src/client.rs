//! Request/response correlation over a frame transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use workspace_model::{lock_unpoisoned, SessionId, Workspace, WorkspaceId, WorkspaceLayout};

use crate::codec::{decode_server_frame, encode_request, Inbound};
use crate::error::SyncError;
use crate::messages::{
    Push, Request, RequestId, Response, SessionErrorCode, SessionInfo, SessionOptions,
    WorkspacePatch, WorkspaceSummary,
};
use crate::transport::Transport;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = HashMap<RequestId, oneshot::Sender<Result<Response, SyncError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    pending: Mutex<Pending>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
    config: ClientConfig,
}

impl ClientInner {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        lock_unpoisoned(&self.pending)
    }

    fn resolve(&self, request_id: RequestId, result: Result<Response, SyncError>) {
        let Some(waiter) = self.pending().remove(&request_id) else {
            debug!(request_id, "dropping frame for unknown or expired request");
            return;
        };
        if waiter.send(result).is_err() {
            debug!(request_id, "requester stopped waiting before the reply arrived");
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let waiters: Vec<_> = self.pending().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(SyncError::Closed));
        }
    }
}

/// Cheaply cloneable handle for issuing typed requests to the server.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Starts the dispatcher task and returns the client with the receiver of
    /// server pushes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<String>,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Push>) {
        let inner = Arc::new(ClientInner {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
        });
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(Arc::clone(&inner), inbound, push_tx));
        (Self { inner }, push_rx)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sends one request and waits for its correlated response, bounded by the
    /// configured timeout.
    pub async fn request(&self, request: Request) -> Result<Response, SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let operation = request.operation();
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_request(request_id, &request)?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(request_id, tx);

        if self.is_closed() {
            self.inner.pending().remove(&request_id);
            return Err(SyncError::Closed);
        }
        if let Err(error) = self.inner.transport.send(frame) {
            self.inner.pending().remove(&request_id);
            return Err(error.into());
        }
        debug!(request_id, operation, "request sent");

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => {
                self.inner.pending().remove(&request_id);
                debug!(request_id, operation, ?timeout, "request timed out");
                Err(SyncError::Timeout {
                    operation,
                    request_id,
                    timeout,
                })
            }
        }
    }

    pub async fn workspace_create(
        &self,
        name: impl Into<String>,
        layout: WorkspaceLayout,
    ) -> Result<Workspace, SyncError> {
        let request = Request::WorkspaceCreate {
            name: name.into(),
            layout,
        };
        expect_workspace("workspace_create", self.request(request).await?)
    }

    pub async fn workspace_get(&self, workspace_id: &WorkspaceId) -> Result<Workspace, SyncError> {
        let request = Request::WorkspaceGet {
            workspace_id: workspace_id.clone(),
        };
        expect_workspace("workspace_get", self.request(request).await?)
    }

    pub async fn workspace_list(&self) -> Result<Vec<WorkspaceSummary>, SyncError> {
        match self.request(Request::WorkspaceList).await? {
            Response::WorkspaceListData { workspaces } => Ok(workspaces),
            Response::WorkspaceError { error } => Err(SyncError::Workspace(error)),
            other => Err(unexpected("workspace_list", &other)),
        }
    }

    pub async fn workspace_update(
        &self,
        workspace_id: &WorkspaceId,
        patch: WorkspacePatch,
    ) -> Result<Workspace, SyncError> {
        let request = Request::WorkspaceUpdate {
            workspace_id: workspace_id.clone(),
            patch,
        };
        expect_workspace("workspace_update", self.request(request).await?)
    }

    pub async fn workspace_delete(&self, workspace_id: &WorkspaceId) -> Result<(), SyncError> {
        let request = Request::WorkspaceDelete {
            workspace_id: workspace_id.clone(),
        };
        match self.request(request).await? {
            Response::Ack => Ok(()),
            Response::WorkspaceError { error } => Err(SyncError::Workspace(error)),
            other => Err(unexpected("workspace_delete", &other)),
        }
    }

    /// Asks the server to re-attach an existing session.
    ///
    /// A missing session is an expected outcome and maps to
    /// [`SyncError::SessionNotFound`].
    pub async fn session_reconnect(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionInfo, SyncError> {
        let request = Request::SessionReconnect {
            session_id: session_id.clone(),
        };
        expect_session("session_reconnect", session_id, self.request(request).await?)
    }

    pub async fn session_create(&self, options: SessionOptions) -> Result<SessionInfo, SyncError> {
        let response = self.request(Request::SessionCreate { options }).await?;
        match response {
            Response::SessionData { session } => Ok(session),
            Response::SessionError { message, .. } => Err(SyncError::SessionRejected(message)),
            other => Err(unexpected("session_create", &other)),
        }
    }

    pub async fn session_close(&self, session_id: &SessionId) -> Result<(), SyncError> {
        let request = Request::SessionClose {
            session_id: session_id.clone(),
        };
        match self.request(request).await? {
            Response::Ack => Ok(()),
            Response::SessionError { code, message } => {
                Err(session_error(session_id, code, message))
            }
            other => Err(unexpected("session_close", &other)),
        }
    }
}

async fn dispatch(
    inner: Arc<ClientInner>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    pushes: mpsc::UnboundedSender<Push>,
) {
    while let Some(raw) = inbound.recv().await {
        match decode_server_frame(&raw) {
            Ok(Inbound::Response {
                request_id,
                response,
            }) => inner.resolve(request_id, Ok(response)),
            Ok(Inbound::VersionMismatch {
                request_id: Some(request_id),
                found,
            }) => {
                warn!(request_id, found, "server frame uses an unsupported protocol version");
                inner.resolve(request_id, Err(SyncError::ProtocolMismatch { found }));
            }
            Ok(Inbound::VersionMismatch {
                request_id: None,
                found,
            }) => {
                warn!(found, "dropping push with unsupported protocol version");
            }
            Ok(Inbound::Undecodable { request_id, reason }) => {
                warn!(request_id, %reason, "server response has an unreadable body");
                inner.resolve(request_id, Err(SyncError::Codec(reason)));
            }
            Ok(Inbound::Push(push)) => {
                if pushes.send(push).is_err() {
                    debug!("push receiver dropped; discarding server push");
                }
            }
            Err(error) => warn!(%error, "discarding malformed server frame"),
        }
    }

    debug!("server connection closed");
    inner.close();
}

fn expect_workspace(operation: &'static str, response: Response) -> Result<Workspace, SyncError> {
    match response {
        Response::WorkspaceData { workspace } => Ok(workspace),
        Response::WorkspaceError { error } => Err(SyncError::Workspace(error)),
        other => Err(unexpected(operation, &other)),
    }
}

fn expect_session(
    operation: &'static str,
    session_id: &SessionId,
    response: Response,
) -> Result<SessionInfo, SyncError> {
    match response {
        Response::SessionData { session } => Ok(session),
        Response::SessionError { code, message } => Err(session_error(session_id, code, message)),
        other => Err(unexpected(operation, &other)),
    }
}

fn session_error(session_id: &SessionId, code: SessionErrorCode, message: String) -> SyncError {
    match code {
        SessionErrorCode::NotFound => SyncError::SessionNotFound(session_id.clone()),
        SessionErrorCode::Unattachable | SessionErrorCode::Rejected => {
            SyncError::SessionUnattachable {
                session_id: session_id.clone(),
                message,
            }
        }
    }
}

fn unexpected(operation: &'static str, response: &Response) -> SyncError {
    SyncError::UnexpectedResponse {
        operation,
        response: response.kind(),
    }
}
