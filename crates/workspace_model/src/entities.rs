use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::ids::{PaneId, SessionId, TabId, WorkspaceId};

/// Top-level arrangement of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    #[default]
    Tabs,
    Grid,
    Mosaic,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceLayout {
    #[serde(rename = "type")]
    pub kind: LayoutKind,
    /// Renderer-owned layout details; stored and round-tripped verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
}

impl WorkspaceLayout {
    #[must_use]
    pub fn new(kind: LayoutKind) -> Self {
        Self {
            kind,
            configuration: None,
        }
    }
}

/// Arrangement of the panes inside one tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabLayout {
    #[default]
    Single,
    Horizontal,
    Vertical,
    Grid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitDirection {
    /// New pane to the right of the source pane.
    Horizontal,
    /// New pane below the source pane.
    Vertical,
}

/// Top-left corner of a pane, as a fraction of the tab area.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanePosition {
    pub x: f64,
    pub y: f64,
}

/// Extent of a pane, as a fraction of the tab area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaneSize {
    pub width: f64,
    pub height: f64,
}

impl Default for PaneSize {
    fn default() -> Self {
        Self {
            width: 1.0,
            height: 1.0,
        }
    }
}

/// Leaf UI unit bound to at most one terminal session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pane {
    pub id: PaneId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub position: PanePosition,
    #[serde(default)]
    pub size: PaneSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl Pane {
    #[must_use]
    pub fn new(title: impl Into<String>, session_id: Option<SessionId>) -> Self {
        Self {
            id: PaneId::generate(),
            title: title.into(),
            position: PanePosition::default(),
            size: PaneSize::default(),
            session_id,
        }
    }

    /// Returns the bound session id when it is present and non-blank.
    #[must_use]
    pub fn bound_session(&self) -> Option<&SessionId> {
        self.session_id.as_ref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Tab {
    pub id: TabId,
    pub title: String,
    #[serde(default)]
    pub layout: TabLayout,
    pub panes: Vec<Pane>,
}

impl Tab {
    #[must_use]
    pub fn new(title: impl Into<String>, first_pane: Pane) -> Self {
        Self {
            id: TabId::generate(),
            title: title.into(),
            layout: TabLayout::Single,
            panes: vec![first_pane],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
    pub tabs: Vec<Tab>,
    pub is_active: bool,
    pub layout: WorkspaceLayout,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Workspace {
    pub const DEFAULT_NAME: &'static str = "Default Workspace";

    #[must_use]
    pub fn new(name: impl Into<String>, layout: WorkspaceLayout) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: WorkspaceId::generate(),
            name: name.into(),
            created_at: now,
            last_accessed: now,
            tabs: Vec::new(),
            is_active: false,
            layout,
            metadata: BTreeMap::new(),
        }
    }

    pub fn panes(&self) -> impl Iterator<Item = &Pane> {
        self.tabs.iter().flat_map(|tab| tab.panes.iter())
    }

    pub fn panes_mut(&mut self) -> impl Iterator<Item = &mut Pane> {
        self.tabs.iter_mut().flat_map(|tab| tab.panes.iter_mut())
    }

    /// Session ids bound to panes of this workspace, in display order.
    #[must_use]
    pub fn bound_sessions(&self) -> Vec<SessionId> {
        self.panes()
            .filter_map(|pane| pane.bound_session().cloned())
            .collect()
    }

    #[must_use]
    pub fn pane_bound_to(&self, session_id: &SessionId) -> Option<&Pane> {
        self.panes()
            .find(|pane| pane.bound_session() == Some(session_id))
    }

    /// Compares two workspaces while ignoring `last_accessed`.
    #[must_use]
    pub fn same_tree(&self, other: &Self) -> bool {
        let mut normalized = other.clone();
        normalized.last_accessed = self.last_accessed;
        *self == normalized
    }
}
