//! Seam between the client runtime and whatever renders terminals.

use std::sync::{Arc, Mutex};

use workspace_model::{lock_unpoisoned, BufferEntry, PaneId, SessionId};

/// Notices shown outside any pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Banner {
    /// The server speaks a protocol version this client does not understand.
    ProtocolMismatch { found: u64 },
    /// No pane could reconnect or obtain a new session.
    ServerUnreachable,
}

impl Banner {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::ProtocolMismatch { found } => format!(
                "server protocol version {found} is not supported; panes were given new sessions"
            ),
            Self::ServerUnreachable => {
                "terminal server is unreachable; working offline".to_string()
            }
        }
    }
}

pub trait UiSink: Send + Sync {
    /// Re-renders cached history for a pane whose session was resumed.
    fn replay(&self, pane_id: &PaneId, session_id: &SessionId, entries: &[BufferEntry]);

    /// Renders live output for a visible session.
    fn render_output(&self, session_id: &SessionId, entry: &BufferEntry);

    fn banner(&self, banner: Banner);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Replay {
        pane_id: PaneId,
        session_id: SessionId,
        entries: Vec<BufferEntry>,
    },
    Output {
        session_id: SessionId,
        entry: BufferEntry,
    },
    Banner(Banner),
}

/// Sink that keeps every call for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<UiEvent>>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<UiEvent> {
        lock_unpoisoned(&self.events).clone()
    }

    /// Returns and clears the recorded events.
    pub fn drain(&self) -> Vec<UiEvent> {
        std::mem::take(&mut *lock_unpoisoned(&self.events))
    }

    #[must_use]
    pub fn banners(&self) -> Vec<Banner> {
        lock_unpoisoned(&self.events)
            .iter()
            .filter_map(|event| match event {
                UiEvent::Banner(banner) => Some(banner.clone()),
                _ => None,
            })
            .collect()
    }

    /// Replayed entries for one session, in replay order.
    #[must_use]
    pub fn replayed(&self, session_id: &SessionId) -> Vec<BufferEntry> {
        lock_unpoisoned(&self.events)
            .iter()
            .filter_map(|event| match event {
                UiEvent::Replay {
                    session_id: replayed,
                    entries,
                    ..
                } if replayed == session_id => Some(entries.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn record(&self, event: UiEvent) {
        lock_unpoisoned(&self.events).push(event);
    }
}

impl UiSink for RecordingSink {
    fn replay(&self, pane_id: &PaneId, session_id: &SessionId, entries: &[BufferEntry]) {
        self.record(UiEvent::Replay {
            pane_id: pane_id.clone(),
            session_id: session_id.clone(),
            entries: entries.to_vec(),
        });
    }

    fn render_output(&self, session_id: &SessionId, entry: &BufferEntry) {
        self.record(UiEvent::Output {
            session_id: session_id.clone(),
            entry: entry.clone(),
        });
    }

    fn banner(&self, banner: Banner) {
        self.record(UiEvent::Banner(banner));
    }
}
