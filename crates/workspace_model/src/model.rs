//! In-memory workspace hierarchy.
//!
//! Every mutator re-establishes two invariants before returning:
//! - at most one workspace is active;
//! - within a workspace, a session id is bound to at most one pane.
//!
//! Mutations are recorded as dirty signals that the persistence pipeline drains with
//! [`WorkspaceModel::take_dirty`].

use std::collections::{BTreeSet, HashSet};

use time::OffsetDateTime;

use crate::entities::{Pane, SplitDirection, Tab, TabLayout, Workspace, WorkspaceLayout};
use crate::error::ModelError;
use crate::ids::{PaneId, SessionId, TabId, WorkspaceId};

/// Records touched since the last [`WorkspaceModel::take_dirty`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDirty {
    pub workspaces: BTreeSet<WorkspaceId>,
    pub removed: BTreeSet<WorkspaceId>,
    pub index: bool,
    pub current: bool,
}

impl ModelDirty {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty() && self.removed.is_empty() && !self.index && !self.current
    }

    pub fn merge(&mut self, other: ModelDirty) {
        for id in other.workspaces {
            self.removed.remove(&id);
            self.workspaces.insert(id);
        }
        for id in other.removed {
            self.workspaces.remove(&id);
            self.removed.insert(id);
        }
        self.index |= other.index;
        self.current |= other.current;
    }
}

/// Where a pane lives in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneLocation {
    pub workspace_id: WorkspaceId,
    pub tab_id: TabId,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceModel {
    workspaces: Vec<Workspace>,
    dirty: ModelDirty,
}

impl WorkspaceModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A model holding one empty, active default workspace.
    #[must_use]
    pub fn with_default_workspace() -> Self {
        let mut model = Self::new();
        let mut workspace = Workspace::new(Workspace::DEFAULT_NAME, WorkspaceLayout::default());
        workspace.is_active = true;
        model.upsert_workspace(workspace);
        model
    }

    /// Rebuilds a model from persisted records, repairing invariant violations.
    ///
    /// The `current` pointer wins the active flag when it names a known workspace;
    /// otherwise the first workspace flagged active keeps it. Duplicate session
    /// bindings inside a workspace are dropped from every pane after the first.
    /// Repaired workspaces are marked dirty so the fixed copy gets persisted.
    #[must_use]
    pub fn from_snapshot(workspaces: Vec<Workspace>, current: Option<&WorkspaceId>) -> Self {
        let mut model = Self {
            workspaces,
            dirty: ModelDirty::default(),
        };

        let active = current
            .filter(|id| model.workspaces.iter().any(|ws| &ws.id == *id))
            .cloned()
            .or_else(|| {
                model
                    .workspaces
                    .iter()
                    .find(|ws| ws.is_active)
                    .map(|ws| ws.id.clone())
            });

        for workspace in &mut model.workspaces {
            let should_be_active = active.as_ref() == Some(&workspace.id);
            let mut repaired = workspace.is_active != should_be_active;
            workspace.is_active = should_be_active;
            repaired |= drop_duplicate_bindings(workspace);
            if repaired {
                model.dirty.workspaces.insert(workspace.id.clone());
            }
        }

        if current != active.as_ref() {
            model.dirty.current = true;
        }

        model
    }

    pub fn workspaces(&self) -> &[Workspace] {
        &self.workspaces
    }

    #[must_use]
    pub fn workspace_ids(&self) -> Vec<WorkspaceId> {
        self.workspaces.iter().map(|ws| ws.id.clone()).collect()
    }

    #[must_use]
    pub fn workspace(&self, id: &WorkspaceId) -> Option<&Workspace> {
        self.workspaces.iter().find(|ws| &ws.id == id)
    }

    #[must_use]
    pub fn active_workspace(&self) -> Option<&Workspace> {
        self.workspaces.iter().find(|ws| ws.is_active)
    }

    #[must_use]
    pub fn current_id(&self) -> Option<&WorkspaceId> {
        self.active_workspace().map(|ws| &ws.id)
    }

    #[must_use]
    pub fn pane(&self, pane_id: &PaneId) -> Option<&Pane> {
        let (ws, tab, pane) = self.locate(pane_id)?;
        Some(&self.workspaces[ws].tabs[tab].panes[pane])
    }

    #[must_use]
    pub fn locate_pane(&self, pane_id: &PaneId) -> Option<PaneLocation> {
        let (ws, tab, pane) = self.locate(pane_id)?;
        let workspace = &self.workspaces[ws];
        Some(PaneLocation {
            workspace_id: workspace.id.clone(),
            tab_id: workspace.tabs[tab].id.clone(),
            index: pane,
        })
    }

    /// Panes of a workspace that carry a session binding, in display order.
    #[must_use]
    pub fn bound_panes(&self, workspace_id: &WorkspaceId) -> Vec<(PaneId, SessionId)> {
        self.workspace(workspace_id)
            .map(|ws| {
                ws.panes()
                    .filter_map(|pane| {
                        pane.bound_session()
                            .map(|session| (pane.id.clone(), session.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the session is bound to a pane of the active workspace.
    #[must_use]
    pub fn is_session_visible(&self, session_id: &SessionId) -> bool {
        self.active_workspace()
            .is_some_and(|ws| ws.pane_bound_to(session_id).is_some())
    }

    /// Every session id bound anywhere in the model.
    #[must_use]
    pub fn all_bound_sessions(&self) -> HashSet<SessionId> {
        self.workspaces
            .iter()
            .flat_map(Workspace::bound_sessions)
            .collect()
    }

    pub fn create_workspace(
        &mut self,
        name: impl Into<String>,
        layout: WorkspaceLayout,
    ) -> WorkspaceId {
        let workspace = Workspace::new(name, layout);
        let id = workspace.id.clone();
        self.workspaces.push(workspace);
        self.mark_workspace(&id);
        self.dirty.index = true;
        id
    }

    /// Inserts or replaces a workspace record, keeping its position when it exists.
    ///
    /// An incoming active record takes the active flag from every other workspace.
    pub fn upsert_workspace(&mut self, mut workspace: Workspace) {
        drop_duplicate_bindings(&mut workspace);
        let id = workspace.id.clone();
        let becomes_active = workspace.is_active;

        match self.workspaces.iter_mut().find(|ws| ws.id == id) {
            Some(existing) => *existing = workspace,
            None => {
                self.workspaces.push(workspace);
                self.dirty.index = true;
            }
        }
        self.mark_workspace(&id);

        if becomes_active {
            self.set_only_active(&id);
        }
    }

    pub fn activate_workspace(&mut self, id: &WorkspaceId) -> Result<(), ModelError> {
        let workspace = self.workspace_mut(id)?;
        workspace.last_accessed = OffsetDateTime::now_utc();
        self.set_only_active(id);
        self.mark_workspace(id);
        Ok(())
    }

    pub fn touch_workspace(&mut self, id: &WorkspaceId) -> Result<(), ModelError> {
        self.workspace_mut(id)?.last_accessed = OffsetDateTime::now_utc();
        self.mark_workspace(id);
        Ok(())
    }

    pub fn rename_workspace(
        &mut self,
        id: &WorkspaceId,
        name: impl Into<String>,
    ) -> Result<(), ModelError> {
        self.workspace_mut(id)?.name = name.into();
        self.mark_workspace(id);
        Ok(())
    }

    /// Removes a workspace and returns the sessions its panes were bound to.
    pub fn remove_workspace(&mut self, id: &WorkspaceId) -> Result<Vec<SessionId>, ModelError> {
        let index = self
            .workspaces
            .iter()
            .position(|ws| &ws.id == id)
            .ok_or_else(|| ModelError::WorkspaceNotFound(id.clone()))?;
        let removed = self.workspaces.remove(index);

        self.dirty.workspaces.remove(id);
        self.dirty.removed.insert(id.clone());
        self.dirty.index = true;
        if removed.is_active {
            self.dirty.current = true;
        }

        Ok(removed.bound_sessions())
    }

    /// Appends a tab with a single pane, optionally bound to `session_id`.
    pub fn create_tab(
        &mut self,
        workspace_id: &WorkspaceId,
        title: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> Result<(TabId, PaneId), ModelError> {
        let title = title.into();
        let workspace = self.workspace_mut(workspace_id)?;
        if let Some(session_id) = session_id.as_ref() {
            ensure_unbound(workspace, session_id, None)?;
        }

        let pane = Pane::new(title.clone(), session_id);
        let pane_id = pane.id.clone();
        let tab = Tab::new(title, pane);
        let tab_id = tab.id.clone();
        workspace.tabs.push(tab);

        self.mark_workspace(workspace_id);
        Ok((tab_id, pane_id))
    }

    pub fn rename_tab(
        &mut self,
        tab_id: &TabId,
        title: impl Into<String>,
    ) -> Result<(), ModelError> {
        let (ws, tab) = self.locate_tab(tab_id)?;
        self.workspaces[ws].tabs[tab].title = title.into();
        self.mark_workspace_index(ws);
        Ok(())
    }

    /// Moves a tab to `new_index` within its workspace, shifting the others.
    pub fn move_tab(&mut self, tab_id: &TabId, new_index: usize) -> Result<(), ModelError> {
        let (ws, tab) = self.locate_tab(tab_id)?;
        let tabs = &mut self.workspaces[ws].tabs;
        if new_index >= tabs.len() {
            return Err(ModelError::TabIndexOutOfRange {
                index: new_index,
                len: tabs.len(),
            });
        }

        let moved = tabs.remove(tab);
        tabs.insert(new_index, moved);
        self.mark_workspace_index(ws);
        Ok(())
    }

    /// Closes a tab and returns the sessions its panes were bound to.
    pub fn close_tab(&mut self, tab_id: &TabId) -> Result<Vec<SessionId>, ModelError> {
        let (ws, tab) = self.locate_tab(tab_id)?;
        let closed = self.workspaces[ws].tabs.remove(tab);
        self.mark_workspace_index(ws);

        Ok(closed
            .panes
            .iter()
            .filter_map(|pane| pane.bound_session().cloned())
            .collect())
    }

    /// Splits `pane_id`, inserting the new pane right after it.
    ///
    /// The source pane gives up half of its extent along the split axis.
    pub fn split_pane(
        &mut self,
        pane_id: &PaneId,
        direction: SplitDirection,
        session_id: Option<SessionId>,
    ) -> Result<PaneId, ModelError> {
        let (ws, tab, pane) = self
            .locate(pane_id)
            .ok_or_else(|| ModelError::PaneNotFound(pane_id.clone()))?;
        let workspace = &mut self.workspaces[ws];
        if let Some(session_id) = session_id.as_ref() {
            ensure_unbound(workspace, session_id, None)?;
        }

        let tab = &mut workspace.tabs[tab];
        let source = &mut tab.panes[pane];
        let mut created = Pane::new(source.title.clone(), session_id);
        created.position = source.position;
        created.size = source.size;

        match direction {
            SplitDirection::Horizontal => {
                let half = source.size.width / 2.0;
                source.size.width = half;
                created.size.width = half;
                created.position.x = source.position.x + half;
            }
            SplitDirection::Vertical => {
                let half = source.size.height / 2.0;
                source.size.height = half;
                created.size.height = half;
                created.position.y = source.position.y + half;
            }
        }

        let split_layout = match direction {
            SplitDirection::Horizontal => TabLayout::Horizontal,
            SplitDirection::Vertical => TabLayout::Vertical,
        };
        tab.layout = match tab.layout {
            TabLayout::Single => split_layout,
            current if current == split_layout => current,
            _ => TabLayout::Grid,
        };

        let created_id = created.id.clone();
        tab.panes.insert(pane + 1, created);
        self.mark_workspace_index(ws);
        Ok(created_id)
    }

    /// Closes a pane; closing the last pane of a tab closes the tab too.
    pub fn close_pane(&mut self, pane_id: &PaneId) -> Result<Option<SessionId>, ModelError> {
        let (ws, tab, pane) = self
            .locate(pane_id)
            .ok_or_else(|| ModelError::PaneNotFound(pane_id.clone()))?;
        let tabs = &mut self.workspaces[ws].tabs;
        let closed = tabs[tab].panes.remove(pane);
        if tabs[tab].panes.is_empty() {
            tabs.remove(tab);
        }

        self.mark_workspace_index(ws);
        Ok(closed.bound_session().cloned())
    }

    /// Replaces a pane's session binding and returns the previous one.
    ///
    /// The pane is looked up at apply time: a pane closed while a reconnect was in
    /// flight yields [`ModelError::PaneNotFound`] and is never recreated. The latest
    /// call wins over earlier bindings of the same pane.
    pub fn rebind(
        &mut self,
        pane_id: &PaneId,
        session_id: SessionId,
    ) -> Result<Option<SessionId>, ModelError> {
        let (ws, tab, pane) = self
            .locate(pane_id)
            .ok_or_else(|| ModelError::PaneNotFound(pane_id.clone()))?;
        let workspace = &mut self.workspaces[ws];
        ensure_unbound(workspace, &session_id, Some(pane_id))?;

        let previous = workspace.tabs[tab].panes[pane]
            .session_id
            .replace(session_id);
        self.mark_workspace_index(ws);
        Ok(previous.filter(|id| !id.is_empty()))
    }

    pub fn unbind(&mut self, pane_id: &PaneId) -> Result<Option<SessionId>, ModelError> {
        let (ws, tab, pane) = self
            .locate(pane_id)
            .ok_or_else(|| ModelError::PaneNotFound(pane_id.clone()))?;
        let previous = self.workspaces[ws].tabs[tab].panes[pane].session_id.take();
        self.mark_workspace_index(ws);
        Ok(previous.filter(|id| !id.is_empty()))
    }

    /// Returns and resets the records touched since the previous call.
    pub fn take_dirty(&mut self) -> ModelDirty {
        std::mem::take(&mut self.dirty)
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Puts back changes that could not be persisted so the next flush retries them.
    pub fn requeue_dirty(&mut self, dirty: ModelDirty) {
        let mut merged = dirty;
        merged.merge(std::mem::take(&mut self.dirty));
        self.dirty = merged;
    }

    /// Replaces a workspace with a copy written by another instance.
    ///
    /// The local active flag is kept and nothing is marked dirty, so the record is
    /// not written back. Unknown workspaces are appended.
    pub fn apply_foreign(&mut self, mut workspace: Workspace) {
        drop_duplicate_bindings(&mut workspace);
        match self.workspaces.iter_mut().find(|ws| ws.id == workspace.id) {
            Some(existing) => {
                workspace.is_active = existing.is_active;
                *existing = workspace;
            }
            None => {
                workspace.is_active = false;
                self.workspaces.push(workspace);
            }
        }
    }

    /// Drops a workspace another instance deleted. The active workspace is kept
    /// and re-marked dirty instead, so this instance writes it back.
    pub fn forget_workspace(&mut self, id: &WorkspaceId) -> bool {
        match self.workspaces.iter().position(|ws| &ws.id == id) {
            Some(index) if self.workspaces[index].is_active => {
                self.mark_workspace(id);
                self.dirty.index = true;
                false
            }
            Some(index) => {
                self.workspaces.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drops a workspace whose record storage evicted to free space.
    ///
    /// The workspace is queued as removed so a copy written after the eviction
    /// is deleted too, and the index stops naming it. Active workspaces are
    /// never evicted and are left untouched.
    pub fn evict_workspace(&mut self, id: &WorkspaceId) -> bool {
        match self.workspaces.iter().position(|ws| &ws.id == id) {
            Some(index) if !self.workspaces[index].is_active => {
                self.workspaces.remove(index);
                self.dirty.workspaces.remove(id);
                self.dirty.removed.insert(id.clone());
                self.dirty.index = true;
                true
            }
            _ => false,
        }
    }

    fn workspace_mut(&mut self, id: &WorkspaceId) -> Result<&mut Workspace, ModelError> {
        self.workspaces
            .iter_mut()
            .find(|ws| &ws.id == id)
            .ok_or_else(|| ModelError::WorkspaceNotFound(id.clone()))
    }

    fn set_only_active(&mut self, id: &WorkspaceId) {
        for workspace in &mut self.workspaces {
            let should_be_active = &workspace.id == id;
            if workspace.is_active != should_be_active {
                workspace.is_active = should_be_active;
                self.dirty.workspaces.insert(workspace.id.clone());
            }
        }
        self.dirty.current = true;
    }

    fn locate(&self, pane_id: &PaneId) -> Option<(usize, usize, usize)> {
        self.workspaces
            .iter()
            .enumerate()
            .find_map(|(ws_index, workspace)| {
                workspace
                    .tabs
                    .iter()
                    .enumerate()
                    .find_map(|(tab_index, tab)| {
                        tab.panes
                            .iter()
                            .position(|pane| &pane.id == pane_id)
                            .map(|pane_index| (ws_index, tab_index, pane_index))
                    })
            })
    }

    fn locate_tab(&self, tab_id: &TabId) -> Result<(usize, usize), ModelError> {
        self.workspaces
            .iter()
            .enumerate()
            .find_map(|(ws_index, workspace)| {
                workspace
                    .tabs
                    .iter()
                    .position(|tab| &tab.id == tab_id)
                    .map(|tab_index| (ws_index, tab_index))
            })
            .ok_or_else(|| ModelError::TabNotFound(tab_id.clone()))
    }

    fn mark_workspace(&mut self, id: &WorkspaceId) {
        self.dirty.removed.remove(id);
        self.dirty.workspaces.insert(id.clone());
    }

    fn mark_workspace_index(&mut self, index: usize) {
        let id = self.workspaces[index].id.clone();
        self.mark_workspace(&id);
    }
}

fn ensure_unbound(
    workspace: &Workspace,
    session_id: &SessionId,
    except: Option<&PaneId>,
) -> Result<(), ModelError> {
    match workspace
        .panes()
        .find(|pane| pane.bound_session() == Some(session_id) && Some(&pane.id) != except)
    {
        Some(pane) => Err(ModelError::SessionAlreadyBound {
            workspace_id: workspace.id.clone(),
            pane_id: pane.id.clone(),
            session_id: session_id.clone(),
        }),
        None => Ok(()),
    }
}

fn drop_duplicate_bindings(workspace: &mut Workspace) -> bool {
    let mut seen = HashSet::new();
    let mut repaired = false;
    for pane in workspace.panes_mut() {
        let Some(session_id) = pane.bound_session().cloned() else {
            continue;
        };
        if !seen.insert(session_id) {
            pane.session_id = None;
            repaired = true;
        }
    }
    repaired
}
