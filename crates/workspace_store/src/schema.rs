use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use workspace_model::{BufferEntry, SessionId, Workspace, WorkspaceId, MAX_LINES};

use crate::error::StoreError;

pub const SCHEMA_VERSION: u32 = 1;

/// Identifies the writer and ordering of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WriteStamp {
    pub writer: String,
    pub revision: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub written_at: OffsetDateTime,
}

impl WriteStamp {
    #[must_use]
    pub fn new(writer: impl Into<String>, revision: u64) -> Self {
        Self {
            writer: writer.into(),
            revision,
            written_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkspaceRecord {
    pub version: u32,
    pub stamp: WriteStamp,
    pub workspace: Workspace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexRecord {
    pub version: u32,
    pub stamp: WriteStamp,
    pub workspace_ids: Vec<WorkspaceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CurrentRecord {
    pub version: u32,
    pub stamp: WriteStamp,
    pub workspace_id: Option<WorkspaceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BufferRecord {
    pub version: u32,
    pub stamp: WriteStamp,
    pub session_id: SessionId,
    pub entries: Vec<BufferEntry>,
}

/// Decodes a stored record, checking the schema version before the typed parse.
///
/// A record written by a newer schema may carry fields this build does not know,
/// so the version is read from the raw value first and reported as
/// [`StoreError::UnsupportedVersion`] rather than a parse failure.
pub fn decode_record<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|source| StoreError::json(key, source))?;
    let found = value
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::invalid(key, "missing numeric 'version' field"))?;
    if found != u64::from(SCHEMA_VERSION) {
        return Err(StoreError::UnsupportedVersion {
            key: key.to_string(),
            found,
            expected: SCHEMA_VERSION,
        });
    }

    serde_json::from_value(value).map_err(|source| StoreError::json(key, source))
}

/// Reads only the stamp of a stored record.
pub fn decode_stamp(key: &str, raw: &str) -> Result<WriteStamp, StoreError> {
    let mut value: Value =
        serde_json::from_str(raw).map_err(|source| StoreError::json(key, source))?;
    let stamp = value
        .get_mut("stamp")
        .map(Value::take)
        .ok_or_else(|| StoreError::invalid(key, "missing 'stamp' field"))?;
    serde_json::from_value(stamp).map_err(|source| StoreError::json(key, source))
}

pub fn encode_record<T: Serialize>(key: &str, record: &T) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|source| StoreError::json_serialize(key, source))
}

pub fn validate_workspace(
    key: &str,
    expected_id: &WorkspaceId,
    workspace: &Workspace,
) -> Result<(), StoreError> {
    if workspace.id.is_empty() {
        return Err(StoreError::invalid(key, "workspace id is empty"));
    }
    if &workspace.id != expected_id {
        return Err(StoreError::invalid(
            key,
            format!("record holds workspace '{}'", workspace.id),
        ));
    }

    let mut pane_ids = HashSet::new();
    let mut sessions = HashSet::new();
    for tab in &workspace.tabs {
        if tab.id.is_empty() {
            return Err(StoreError::invalid(key, "tab id is empty"));
        }
        for pane in &tab.panes {
            if pane.id.is_empty() || !pane_ids.insert(&pane.id) {
                return Err(StoreError::invalid(
                    key,
                    format!("pane id '{}' is empty or duplicated", pane.id),
                ));
            }
            if let Some(session_id) = pane.bound_session() {
                if !sessions.insert(session_id) {
                    return Err(StoreError::invalid(
                        key,
                        format!("session '{session_id}' is bound to more than one pane"),
                    ));
                }
            }
        }
    }

    Ok(())
}

pub fn validate_buffer(
    key: &str,
    expected: &SessionId,
    record: &BufferRecord,
) -> Result<(), StoreError> {
    if &record.session_id != expected {
        return Err(StoreError::invalid(
            key,
            format!("record holds session '{}'", record.session_id),
        ));
    }
    if record.entries.len() > MAX_LINES {
        return Err(StoreError::invalid(
            key,
            format!("{} entries exceed the {MAX_LINES} line cap", record.entries.len()),
        ));
    }

    Ok(())
}
