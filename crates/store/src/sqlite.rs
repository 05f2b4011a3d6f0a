//! SQLite-backed implementation of the three store contracts.

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    sqlx::SqlitePool,
    tracing::warn,
};

use trellis_protocol::{Address, WILDCARD};

use crate::{
    AuthRecord, AuthStore, EndpointConfig, EndpointStore, LogEntry, LogStore, Result, StoreError,
};

/// One pool, three contracts.
#[derive(Clone)]
pub struct SqliteHubStore {
    pool: SqlitePool,
}

impl SqliteHubStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and create the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(url).await?;
        Self::init(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Initialize the schema. Idempotent; also used by tests against
    /// in-memory databases.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS auth (
                name            TEXT PRIMARY KEY,
                api_key         TEXT    NOT NULL,
                enabled         INTEGER NOT NULL DEFAULT 0,
                activation_code TEXT    NOT NULL DEFAULT ''
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS endpoints (
                address    TEXT PRIMARY KEY,
                name       TEXT NOT NULL DEFAULT '',
                attributes TEXT NOT NULL DEFAULT 'null'
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS log (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                address   TEXT    NOT NULL,
                message   TEXT    NOT NULL,
                timestamp INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_timestamp ON log (timestamp DESC)")
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn all_auth_rows(&self) -> Result<Vec<AuthRecord>> {
        let rows = sqlx::query_as::<_, (String, String, bool, String)>(
            "SELECT name, api_key, enabled, activation_code FROM auth ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AuthRecord {
                name: r.0,
                api_key: r.1,
                enabled: r.2,
                activation_code: r.3,
            })
            .collect())
    }

    async fn all_endpoint_rows(&self) -> Result<Vec<EndpointConfig>> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT address, name, attributes FROM endpoints ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| EndpointConfig {
                address: r.0,
                name: r.1,
                attributes: serde_json::from_str(&r.2).unwrap_or(serde_json::Value::Null),
            })
            .collect())
    }
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Wildcard-aware equality on a single address component.
fn component_matches(a: &str, b: &str) -> bool {
    a == WILDCARD || b == WILDCARD || a == b
}

#[async_trait]
impl AuthStore for SqliteHubStore {
    async fn find(&self, probe: &Address) -> Result<Option<AuthRecord>> {
        // The auth collection is small; fetch and pattern-match in process
        // rather than pushing wildcard semantics into SQL.
        let mut matches: Vec<AuthRecord> = Vec::new();
        for record in self.all_auth_rows().await? {
            match Address::parse(&record.name) {
                Ok(name) if name.matches(probe) => matches.push(record),
                Ok(_) => {},
                Err(e) => warn!(name = %record.name, error = %e, "skipping malformed auth record"),
            }
        }

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(StoreError::AmbiguousPattern {
                pattern: probe.to_string(),
                count,
            }),
        }
    }

    async fn upsert(&self, record: AuthRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth (name, api_key, enabled, activation_code)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                api_key         = excluded.api_key,
                enabled         = excluded.enabled,
                activation_code = excluded.activation_code",
        )
        .bind(&record.name)
        .bind(&record.api_key)
        .bind(record.enabled)
        .bind(&record.activation_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activate(&self, code: &str) -> Result<bool> {
        if code.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE auth SET enabled = 1, activation_code = '' WHERE activation_code = ?",
        )
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn import_all(&self, json: &str) -> Vec<String> {
        let snapshot: BTreeMap<String, Vec<serde_json::Value>> = match serde_json::from_str(json) {
            Ok(s) => s,
            Err(e) => return vec![format!("malformed import payload: {e}")],
        };

        let mut errors = Vec::new();
        for (collection, rows) in snapshot {
            for row in rows {
                let outcome = match collection.as_str() {
                    "auth" => match serde_json::from_value::<AuthRecord>(row) {
                        Ok(record) => {
                            AuthStore::upsert(self, record).await.map_err(|e| e.to_string())
                        },
                        Err(e) => Err(e.to_string()),
                    },
                    "endpoints" => match serde_json::from_value::<EndpointConfig>(row) {
                        Ok(endpoint) => {
                            EndpointStore::upsert(self, endpoint)
                                .await
                                .map_err(|e| e.to_string())
                        },
                        Err(e) => Err(e.to_string()),
                    },
                    other => Err(format!("unknown collection `{other}`")),
                };
                if let Err(e) = outcome {
                    errors.push(format!("{collection}: {e}"));
                }
            }
        }
        errors
    }

    async fn export_all(&self) -> Result<BTreeMap<String, Vec<serde_json::Value>>> {
        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "auth".to_string(),
            self.all_auth_rows()
                .await?
                .into_iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect(),
        );
        snapshot.insert(
            "endpoints".to_string(),
            self.all_endpoint_rows()
                .await?
                .into_iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect(),
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl EndpointStore for SqliteHubStore {
    async fn find_by_host(&self, probe: &Address) -> Result<Vec<EndpointConfig>> {
        let rows = self.all_endpoint_rows().await?;
        Ok(rows
            .into_iter()
            .filter(|e| match Address::parse(&e.address) {
                Ok(addr) => {
                    component_matches(&addr.domain, &probe.domain)
                        && component_matches(&addr.host, &probe.host)
                },
                Err(_) => false,
            })
            .collect())
    }

    async fn list_by_domain(&self, domain: &str) -> Result<Vec<EndpointConfig>> {
        let rows = self.all_endpoint_rows().await?;
        Ok(rows
            .into_iter()
            .filter(|e| match Address::parse(&e.address) {
                Ok(addr) => component_matches(&addr.domain, domain),
                Err(_) => false,
            })
            .collect())
    }

    async fn upsert(&self, endpoint: EndpointConfig) -> Result<()> {
        let attributes = serde_json::to_string(&endpoint.attributes)
            .map_err(|e| StoreError::Payload(e.to_string()))?;
        sqlx::query(
            "INSERT INTO endpoints (address, name, attributes)
             VALUES (?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                name       = excluded.name,
                attributes = excluded.attributes",
        )
        .bind(&endpoint.address)
        .bind(&endpoint.name)
        .bind(&attributes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for SqliteHubStore {
    async fn write(&self, message: &str, source: &Address) -> Result<()> {
        sqlx::query("INSERT INTO log (address, message, timestamp) VALUES (?, ?, ?)")
            .bind(source.to_string())
            .bind(message)
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read(&self, filter: &str) -> Result<Vec<LogEntry>> {
        let pattern = format!("%{filter}%");
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT address, message, timestamp FROM log
             WHERE address LIKE ? OR message LIKE ?
             ORDER BY timestamp DESC",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| LogEntry {
                address: r.0,
                message: r.1,
                timestamp: r.2,
            })
            .collect())
    }
}
