use std::sync::Arc;

use sync_protocol::{ClientConfig, Push, SyncClient};
use sync_protocol_mock::{MockServer, SessionBehavior, MOCK_TRANSPORT_ID};
use tokio::sync::mpsc;

pub const DEFAULT_TRANSPORT_ID: &str = MOCK_TRANSPORT_ID;

/// A connected client plus whatever the transport needs to stay alive.
pub struct Connection {
    pub client: SyncClient,
    pub pushes: mpsc::UnboundedReceiver<Push>,
    /// Present for the in-process server so callers can drive it.
    pub server: Option<MockServer>,
}

/// Connects using the transport named by `transport_id`.
///
/// Must be called from within a Tokio runtime.
pub fn connect_for_id(transport_id: &str, config: ClientConfig) -> Result<Connection, String> {
    match transport_id {
        DEFAULT_TRANSPORT_ID => {
            let (server, inbound) = MockServer::new();
            // The in-process server outlives client restarts, so sessions from a
            // previous run are still there.
            server.set_unknown_session_behavior(SessionBehavior::Live);
            let (client, pushes) = SyncClient::connect(Arc::new(server.clone()), inbound, config);
            Ok(Connection {
                client,
                pushes,
                server: Some(server),
            })
        }
        unknown => Err(format!(
            "Unsupported transport '{unknown}'. Available transports: {DEFAULT_TRANSPORT_ID}"
        )),
    }
}
