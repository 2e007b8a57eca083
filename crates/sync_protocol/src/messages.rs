//! Wire contract between a client and the terminal server.
//!
//! Client frames wrap a [`Request`] with a request id. Server frames either answer
//! a request (carrying the same id) or push terminal output. Every frame carries
//! the protocol version `v`.

use serde::{Deserialize, Serialize};
use workspace_model::{
    EntryKind, PaneId, SessionId, Tab, Workspace, WorkspaceId, WorkspaceLayout,
};

pub const PROTOCOL_VERSION: u32 = 1;

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    WorkspaceCreate {
        name: String,
        layout: WorkspaceLayout,
    },
    WorkspaceGet {
        workspace_id: WorkspaceId,
    },
    WorkspaceList,
    WorkspaceUpdate {
        workspace_id: WorkspaceId,
        patch: WorkspacePatch,
    },
    WorkspaceDelete {
        workspace_id: WorkspaceId,
    },
    SessionReconnect {
        session_id: SessionId,
    },
    SessionCreate {
        options: SessionOptions,
    },
    SessionClose {
        session_id: SessionId,
    },
}

impl Request {
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::WorkspaceCreate { .. } => "workspace_create",
            Self::WorkspaceGet { .. } => "workspace_get",
            Self::WorkspaceList => "workspace_list",
            Self::WorkspaceUpdate { .. } => "workspace_update",
            Self::WorkspaceDelete { .. } => "workspace_delete",
            Self::SessionReconnect { .. } => "session_reconnect",
            Self::SessionCreate { .. } => "session_create",
            Self::SessionClose { .. } => "session_close",
        }
    }
}

/// Partial workspace update; absent fields are left unchanged by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspacePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<WorkspaceLayout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Vec<Tab>>,
}

impl WorkspacePatch {
    #[must_use]
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Applies the patch to a local copy.
    pub fn apply(&self, workspace: &mut Workspace) {
        if let Some(name) = &self.name {
            workspace.name.clone_from(name);
        }
        if let Some(layout) = &self.layout {
            workspace.layout = layout.clone();
        }
        if let Some(tabs) = &self.tabs {
            workspace.tabs.clone_from(tabs);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<PaneId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl SessionOptions {
    #[must_use]
    pub fn for_pane(workspace_id: &WorkspaceId, pane_id: &PaneId) -> Self {
        Self {
            workspace_id: Some(workspace_id.clone()),
            pane_id: Some(pane_id.clone()),
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionInfo {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceSummary {
    pub id: WorkspaceId,
    pub name: String,
    #[serde(default)]
    pub tab_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorCode {
    NotFound,
    Unattachable,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    WorkspaceData {
        workspace: Workspace,
    },
    WorkspaceError {
        error: String,
    },
    WorkspaceListData {
        workspaces: Vec<WorkspaceSummary>,
    },
    Ack,
    SessionData {
        session: SessionInfo,
    },
    SessionError {
        code: SessionErrorCode,
        #[serde(default)]
        message: String,
    },
}

impl Response {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkspaceData { .. } => "workspace_data",
            Self::WorkspaceError { .. } => "workspace_error",
            Self::WorkspaceListData { .. } => "workspace_list_data",
            Self::Ack => "ack",
            Self::SessionData { .. } => "session_data",
            Self::SessionError { .. } => "session_error",
        }
    }
}

/// Unsolicited server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Push {
    TerminalOutput {
        session_id: SessionId,
        chunk: String,
        #[serde(rename = "type")]
        kind: EntryKind,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientFrame {
    pub v: u32,
    pub request_id: RequestId,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseFrame {
    pub v: u32,
    pub request_id: RequestId,
    pub response: Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushFrame {
    pub v: u32,
    pub push: Push,
}
