//! Client side of terminal session resume.
//!
//! ## Startup
//!
//! 1. Load the persisted workspace snapshot (or start with a default workspace).
//! 2. Ask the server to reconnect every session bound in the active workspace.
//! 3. Replay cached output for confirmed sessions; give the others new sessions.
//! 4. Hand control to [`ClientRuntime::run`], which persists changes on a debounce
//!    and picks up writes from other instances sharing the same storage.
//!
//! ## Transport selection
//!
//! `TERMSYNC_TRANSPORT=mock` (the default) connects to the in-process
//! `sync_protocol_mock` server. Other transports plug in through
//! [`sync_protocol::Transport`].

pub mod coordinator;
pub mod runtime;
pub mod sink;
pub mod state;
pub mod transports;

pub use coordinator::{
    FailureReason, PaneOutcome, PaneReport, ReconnectionCoordinator, RestoreReport,
    RestoreSource, RestoreState,
};
pub use runtime::{
    ClientRuntime, CommandOutcome, RuntimeError, RuntimeHandle, RuntimeOptions, UiCommand,
};
pub use sink::{Banner, RecordingSink, UiEvent, UiSink};
pub use state::ClientState;
