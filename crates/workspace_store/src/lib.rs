mod debounce;
mod error;
mod keys;
mod kv;
mod manager;
mod schema;

pub use debounce::Debouncer;
pub use error::StoreError;
pub use keys::{
    buffer_key, key_file_name, workspace_key, StorageKey, BUFFER_PREFIX, CURRENT_KEY, INDEX_KEY,
    WORKSPACE_PREFIX,
};
pub use kv::{FileStore, KeyValueStore, MemoryStore};
pub use manager::{
    EvictionPolicy, EvictionReport, ForeignChanges, LoadOutcome, NotFoundReason,
    PersistenceManager, Snapshot,
};
pub use schema::{
    BufferRecord, CurrentRecord, IndexRecord, WorkspaceRecord, WriteStamp, SCHEMA_VERSION,
};
