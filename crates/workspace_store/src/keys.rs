use workspace_model::{SessionId, WorkspaceId};

pub const INDEX_KEY: &str = "workspaces:index";
pub const CURRENT_KEY: &str = "workspaces:current";
pub const WORKSPACE_PREFIX: &str = "workspaces:";
pub const BUFFER_PREFIX: &str = "buffer:";

#[must_use]
pub fn workspace_key(id: &WorkspaceId) -> String {
    format!("{WORKSPACE_PREFIX}{id}")
}

#[must_use]
pub fn buffer_key(id: &SessionId) -> String {
    format!("{BUFFER_PREFIX}{id}")
}

/// Logical storage key, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKey {
    Index,
    Current,
    Workspace(WorkspaceId),
    Buffer(SessionId),
}

impl StorageKey {
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            INDEX_KEY => Some(Self::Index),
            CURRENT_KEY => Some(Self::Current),
            _ => {
                if let Some(id) = key.strip_prefix(WORKSPACE_PREFIX) {
                    return (!id.is_empty()).then(|| Self::Workspace(WorkspaceId::new(id)));
                }
                key.strip_prefix(BUFFER_PREFIX)
                    .filter(|id| !id.is_empty())
                    .map(|id| Self::Buffer(SessionId::new(id)))
            }
        }
    }
}

/// Maps a logical key onto a file name, escaping characters that are unsafe in paths.
#[must_use]
pub fn key_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 5);
    for c in key.chars() {
        match c {
            '%' => name.push_str("%25"),
            ':' => name.push_str("%3A"),
            '/' => name.push_str("%2F"),
            '\\' => name.push_str("%5C"),
            _ => name.push(c),
        }
    }
    name.push_str(".json");
    name
}

/// Inverse of [`key_file_name`]; `None` for files this store did not write.
#[must_use]
pub fn key_from_file_name(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".json")?;
    let mut key = String::with_capacity(stem.len());
    let mut rest = stem;
    while let Some(index) = rest.find('%') {
        key.push_str(&rest[..index]);
        let code = rest.get(index + 1..index + 3)?;
        key.push(match code {
            "25" => '%',
            "3A" => ':',
            "2F" => '/',
            "5C" => '\\',
            _ => return None,
        });
        rest = &rest[index + 3..];
    }
    key.push_str(rest);
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_key_family() {
        assert_eq!(StorageKey::parse(INDEX_KEY), Some(StorageKey::Index));
        assert_eq!(StorageKey::parse(CURRENT_KEY), Some(StorageKey::Current));
        assert_eq!(
            StorageKey::parse("workspaces:ws_1"),
            Some(StorageKey::Workspace(WorkspaceId::new("ws_1")))
        );
        assert_eq!(
            StorageKey::parse("buffer:S1"),
            Some(StorageKey::Buffer(SessionId::new("S1")))
        );
        assert_eq!(StorageKey::parse("buffer:"), None);
        assert_eq!(StorageKey::parse("other"), None);
    }

    #[test]
    fn file_names_are_reversible() {
        for key in ["workspaces:index", "buffer:a/b%c", "buffer:x\\y"] {
            let file = key_file_name(key);
            assert!(!file.contains(':') && !file.contains('/'));
            assert_eq!(key_from_file_name(&file).as_deref(), Some(key));
        }
        assert_eq!(key_from_file_name("notes.txt"), None);
    }
}
