//! Client side of the terminal server protocol.
//!
//! This crate owns the message contract, request/response correlation and timeout
//! enforcement. The connection itself is abstracted behind [`Transport`].

pub mod client;
pub mod codec;
pub mod error;
pub mod messages;
pub mod transport;

pub use client::{ClientConfig, SyncClient, DEFAULT_REQUEST_TIMEOUT};
pub use codec::{decode_client_frame, decode_server_frame, encode, encode_request, Inbound};
pub use error::{SyncError, TransportError};
pub use messages::{
    ClientFrame, Push, PushFrame, Request, RequestId, Response, ResponseFrame, SessionErrorCode,
    SessionInfo, SessionOptions, WorkspacePatch, WorkspaceSummary, PROTOCOL_VERSION,
};
pub use transport::{ChannelTransport, Transport};
