//! Persistence contracts consumed by the hub, and their SQLite implementation.
//!
//! The hub never talks to a database directly: admission goes through
//! [`AuthStore`], provisioning through [`EndpointStore`], and the audit log
//! through [`LogStore`]. [`sqlite::SqliteHubStore`] implements all three over
//! one pool.

pub mod sqlite;

use std::collections::BTreeMap;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

use trellis_protocol::Address;

pub use sqlite::SqliteHubStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("ambiguous auth records for `{pattern}`: {count} match")]
    AmbiguousPattern { pattern: String, count: usize },

    #[error("malformed payload: {0}")]
    Payload(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ── Records ──────────────────────────────────────────────────────────────────

/// One admission credential. `name` is a canonical address string, possibly
/// containing wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub name: String,
    pub api_key: String,
    pub enabled: bool,
    #[serde(default)]
    pub activation_code: String,
}

/// Per-endpoint configuration shipped to IoT clients at admission. The
/// `attributes` blob is opaque to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// One audit-log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: String,
    pub message: String,
    pub timestamp: i64,
}

// ── Contracts ────────────────────────────────────────────────────────────────

/// Admission credentials, queried by address pattern.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Find the record whose (possibly wildcarded) name matches the probe
    /// address. At most one record may match; more is an
    /// [`StoreError::AmbiguousPattern`] and rejects admission.
    async fn find(&self, probe: &Address) -> Result<Option<AuthRecord>>;

    /// Insert or replace by `name`.
    async fn upsert(&self, record: AuthRecord) -> Result<()>;

    /// Enable the record carrying this activation code and clear the code.
    /// Returns whether a record was activated.
    async fn activate(&self, code: &str) -> Result<bool>;

    /// Import a JSON snapshot previously produced by [`export_all`]
    /// (`{collection: [rows]}`). Returns one error string per rejected row.
    ///
    /// [`export_all`]: AuthStore::export_all
    async fn import_all(&self, json: &str) -> Vec<String>;

    /// Dump every collection as JSON rows.
    async fn export_all(&self) -> Result<BTreeMap<String, Vec<serde_json::Value>>>;
}

/// Endpoint configurations for provisioning and discovery.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Endpoints that live on the probe's host (domain and host components
    /// match, wildcard-aware; kind/address/id are not considered).
    async fn find_by_host(&self, probe: &Address) -> Result<Vec<EndpointConfig>>;

    /// Every endpoint of a tenancy domain.
    async fn list_by_domain(&self, domain: &str) -> Result<Vec<EndpointConfig>>;

    /// Insert or replace by `address`.
    async fn upsert(&self, endpoint: EndpointConfig) -> Result<()>;
}

/// Append-only audit log.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn write(&self, message: &str, source: &Address) -> Result<()>;

    /// Rows whose address OR message contains the filter substring.
    async fn read(&self, filter: &str) -> Result<Vec<LogEntry>>;
}
