use thiserror::Error;

use crate::ids::{PaneId, SessionId, TabId, WorkspaceId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("workspace '{0}' does not exist")]
    WorkspaceNotFound(WorkspaceId),

    #[error("tab '{0}' does not exist")]
    TabNotFound(TabId),

    #[error("pane '{0}' does not exist")]
    PaneNotFound(PaneId),

    #[error("session '{session_id}' is already bound to pane '{pane_id}' in workspace '{workspace_id}'")]
    SessionAlreadyBound {
        workspace_id: WorkspaceId,
        pane_id: PaneId,
        session_id: SessionId,
    },

    #[error("tab index {index} is out of range for {len} tabs")]
    TabIndexOutOfRange { index: usize, len: usize },
}
