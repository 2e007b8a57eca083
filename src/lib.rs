//! Terminal workspace persistence and session resume.
//!
//! The root crate carries the ambient pieces shared by every client binary:
//! environment configuration and logging setup. The building blocks live in
//! workspace crates and are re-exported here:
//!
//! - [`model`]: workspace hierarchy and capped session buffers;
//! - [`store`]: durable snapshots, eviction and cross-instance stamps;
//! - [`protocol`]: the server message contract and correlating client.
//!
//! # Public API Overview
//! - Read settings with [`SyncConfig::from_env`].
//! - Install logging with [`logging::init`].
//! - Build a [`WorkspaceModel`], persist it through a [`PersistenceManager`] and
//!   talk to the server with a [`SyncClient`].

pub mod config;
pub mod logging;

pub use sync_protocol as protocol;
pub use workspace_model as model;
pub use workspace_store as store;

pub use crate::config::SyncConfig;
pub use crate::logging::LoggingError;

/// Core model types.
pub use workspace_model::{
    BufferEntry, BufferStore, EntryKind, PaneId, SessionId, TabId, Workspace, WorkspaceId,
    WorkspaceModel, MAX_LINES,
};
/// Persistence entry points.
pub use workspace_store::{FileStore, KeyValueStore, LoadOutcome, MemoryStore, PersistenceManager};
/// Protocol client entry points.
pub use sync_protocol::{ClientConfig, SyncClient, SyncError, Transport, PROTOCOL_VERSION};
