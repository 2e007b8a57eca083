//! Workspace hierarchy and per-session output buffers.

pub mod buffer;
pub mod entities;
pub mod error;
pub mod ids;
pub mod lock;
pub mod model;

pub use buffer::{
    BufferDirty, BufferEntry, BufferStats, BufferStore, EntryKind, SessionBuffer, MAX_LINES,
};
pub use entities::{
    LayoutKind, Pane, PanePosition, PaneSize, SplitDirection, Tab, TabLayout, Workspace,
    WorkspaceLayout,
};
pub use error::ModelError;
pub use ids::{PaneId, SessionId, TabId, WorkspaceId};
pub use lock::lock_unpoisoned;
pub use model::{ModelDirty, PaneLocation, WorkspaceModel};
