use serde::Serialize;
use serde_json::Value;

use crate::error::SyncError;
use crate::messages::{
    ClientFrame, Push, PushFrame, Request, RequestId, Response, ResponseFrame, PROTOCOL_VERSION,
};

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        request_id: RequestId,
        response: Response,
    },
    /// A frame whose version this client does not speak. The request id is kept
    /// when present so the waiting request can be failed.
    VersionMismatch {
        request_id: Option<RequestId>,
        found: u64,
    },
    /// A response whose body could not be parsed. The waiting request fails
    /// with `reason` instead of running into its timeout.
    Undecodable {
        request_id: RequestId,
        reason: String,
    },
    Push(Push),
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String, SyncError> {
    serde_json::to_string(frame).map_err(|error| SyncError::Codec(error.to_string()))
}

pub fn encode_request(request_id: RequestId, request: &Request) -> Result<String, SyncError> {
    encode(&ClientFrame {
        v: PROTOCOL_VERSION,
        request_id,
        request: request.clone(),
    })
}

pub fn decode_client_frame(raw: &str) -> Result<ClientFrame, SyncError> {
    serde_json::from_str(raw).map_err(|error| SyncError::Codec(error.to_string()))
}

/// Decodes a server frame in two steps: the envelope fields first, then the typed
/// body, so an unknown version is reported instead of a shape error.
pub fn decode_server_frame(raw: &str) -> Result<Inbound, SyncError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|error| SyncError::Codec(error.to_string()))?;
    let found = value
        .get("v")
        .and_then(Value::as_u64)
        .ok_or_else(|| SyncError::Codec("frame has no numeric 'v' field".to_string()))?;
    let request_id = value.get("request_id").and_then(Value::as_u64);

    if found != u64::from(PROTOCOL_VERSION) {
        return Ok(Inbound::VersionMismatch { request_id, found });
    }

    if let Some(request_id) = request_id {
        return Ok(match serde_json::from_value::<ResponseFrame>(value) {
            Ok(frame) => Inbound::Response {
                request_id: frame.request_id,
                response: frame.response,
            },
            Err(error) => Inbound::Undecodable {
                request_id,
                reason: error.to_string(),
            },
        });
    }

    let frame: PushFrame =
        serde_json::from_value(value).map_err(|error| SyncError::Codec(error.to_string()))?;
    Ok(Inbound::Push(frame.push))
}
