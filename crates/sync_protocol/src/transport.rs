use tokio::sync::mpsc;

use crate::error::TransportError;

/// Outbound half of a server connection.
///
/// Inbound frames are delivered separately on the receiver handed to
/// [`crate::SyncClient::connect`]; closing that channel closes the connection.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, frame: String) -> Result<(), TransportError>;
}

/// Transport backed by an in-process channel, useful when the server end lives in
/// the same process.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// Returns the transport and the receiver the server end reads from.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, server_rx) = mpsc::unbounded_channel();
        (Self { outbound }, server_rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::new("server end of the channel is closed"))
    }
}
