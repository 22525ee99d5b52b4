//! SmartStore is an embedded, queryable JSON document store layered over SQLite.
//!
//! Documents ("soup elements") live in named collections ("soups"). Each soup is
//! backed by one physical table whose indexed paths are projected into columns,
//! so soups can be queried with structured [`QuerySpec`]s or with "smart SQL",
//! a templated SQL dialect where `{soup}` and `{soup:path}` tokens are resolved
//! against the soup catalog.
//!
//! ## Core Components
//! - [`engine`]: The soup engine (catalog, metadata cache, smart SQL translator,
//!   store facade, resumable alter-soup migrations and the pagination cursor).
//! - [`kv`]: The encrypted key-value blob store used for externally stored
//!   documents, plus an LRU caching decorator.
//! - [`config`]: Store configuration, including environment discovery.
//! - [`events`]: Fire-and-forget notifications for administrative operations.

pub mod config;
pub mod engine;
pub mod events;
pub mod kv;

pub use config::StoreConfig;
pub use engine::{
    AlterSoupOperation, AlterSoupStep, IndexSpec, IndexType, Order, QuerySpec, QueryType,
    SmartStore, SoupFeature, SoupSpec, StoreCursor,
};
pub use events::{LogEventSink, StoreEvent, StoreEventSink};
pub use kv::{KeyValueCachedStore, KeyValueEncryptedFileStore, KeyValueStore};

use thiserror::Error;

/// Errors returned by SmartStore.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested soup does not exist.
    #[error("soup not found: {0}")]
    SoupNotFound(String),
    /// The requested soup element does not exist.
    #[error("entry {entry_id} not found in soup {soup_name}")]
    EntryNotFound { soup_name: String, entry_id: i64 },
    /// The operation violates a store invariant (bad registration, missing
    /// upsert identity, non-SELECT smart SQL, ...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// A smart SQL token could not be resolved.
    #[error("smart sql error at position {position}: {message}")]
    SmartSql { position: usize, message: String },
    /// Stored data contradicts an expectation (e.g. ambiguous external id).
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),
    /// A document is not a JSON object.
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Error raised by the backing SQL engine.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// An I/O error occurred in the blob store or while opening the store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for SmartStore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reserved path of the entry id injected into every soup element.
pub const SOUP_ENTRY_ID: &str = "_soupEntryId";
/// Reserved path of the creation timestamp (epoch milliseconds).
pub const SOUP_CREATED_DATE: &str = "_soupCreatedDate";
/// Reserved path of the last modification timestamp (epoch milliseconds).
pub const SOUP_LAST_MODIFIED_DATE: &str = "_soupLastModifiedDate";
/// Reserved smart SQL path denoting the whole document.
pub const SOUP_PATH: &str = "_soup";
