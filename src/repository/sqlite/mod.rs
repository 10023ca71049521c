//! SQLite implementation of `IdempotenceRepository`.
//!
//! This provides the persistent claim state that survives endpoint
//! restarts, which the recovery pass depends on.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table tracking the schema version
//! per namespace. When the schema needs to change, increment
//! `CURRENT_SCHEMA_VERSION` and add a migration in `run_migrations()`.
//! Migrations run sequentially from the recorded version to the target
//! version.
//!
//! # Namespacing
//!
//! SQLite has no schemas, so the configured namespace becomes a table-name
//! prefix. Endpoints with different namespaces can share one database file
//! without observing each other's rows. The namespace is validated as an
//! identifier before it is ever interpolated into SQL.

mod claim;
mod deferred;
mod recovery;


use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    DeferredMessage, IdempotenceRepository, ProcessingStatus, RepositoryError,
};
use crate::config::{IdempotenceConfig, DEFAULT_NAMESPACE};
use crate::message::{MessageId, WorkerId};

/// Current schema version. Increment this when making schema changes and
/// add corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Table names derived from the configured namespace.
///
/// Immutable once built; every query in the claim, deferred and recovery
/// modules takes its table names from here rather than from globals.
#[derive(Debug)]
pub(crate) struct Tables {
    claim: String,
    history: String,
    deferred: String,
}

impl Tables {
    fn new(namespace: &str) -> Self {
        Self {
            claim: format!("{namespace}_processing_claim"),
            history: format!("{namespace}_processing_history"),
            deferred: format!("{namespace}_deferred_message"),
        }
    }
}

/// SQLite-backed idempotence repository.
///
/// Holds one connection for the endpoint; synchronous rusqlite operations
/// run via `tokio::task::spawn_blocking` so they don't block the async
/// runtime. Workers in other processes open their own repository against
/// the same database file; SQLite's transactional guarantees are the only
/// cross-process synchronization.
pub struct SqliteRepository {
    /// Database connection. Exposed as `pub(crate)` for test access to
    /// inspect rows directly.
    pub(crate) conn: Arc<Mutex<Connection>>,
    tables: Arc<Tables>,
}

impl SqliteRepository {
    /// Open (or create) the database described by `config`.
    ///
    /// Validates the configuration, creates the schema if needed, and runs
    /// any pending migrations.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for better concurrency and crash safety
    /// - `synchronous = FULL` for maximum durability
    /// - `busy_timeout = 5000ms` to handle concurrent access gracefully
    pub fn new(config: &IdempotenceConfig) -> Result<Self, RepositoryError> {
        config.validate()?;

        let path_str = config.database_path.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        // Ensure parent directory exists (unless it's :memory:)
        if !is_in_memory {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(&config.database_path)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // Configure durability settings.
        // We must verify WAL mode was actually enabled - SQLite can silently
        // keep DELETE mode on some filesystems (e.g., network filesystems
        // that don't support shared memory), which would violate our
        // durability/concurrency assumptions.
        //
        // For in-memory databases (:memory:), SQLite returns "memory" as the
        // journal mode, which is expected - there's no durability concern
        // since in-memory databases are ephemeral by design.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'. \
                     This can happen on filesystems that don't support shared memory. \
                     The claim protocol requires WAL mode for its durability and \
                     concurrency guarantees.",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        // Create schema version table if it doesn't exist
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                namespace TEXT PRIMARY KEY,
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        // Get current version for this namespace (0 = fresh)
        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE namespace = ?1",
                params![config.namespace],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        let tables = Tables::new(&config.namespace);
        Self::run_migrations(&conn, &tables, &config.namespace, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: Arc::new(tables),
        })
    }

    /// Create an ephemeral in-memory repository with the default namespace.
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(&IdempotenceConfig::new(":memory:", DEFAULT_NAMESPACE))
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(
        conn: &Connection,
        tables: &Tables,
        namespace: &str,
        from_version: i64,
    ) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Migration from version 0 (fresh namespace) to version 1: the
        // three-table claim shape. A history row is authoritative proof of
        // completed processing and is never deleted by the claim protocol.
        if from_version < 1 {
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {claim} (
                    message_id TEXT PRIMARY KEY,
                    inbox_uri TEXT NOT NULL,
                    date_started INTEGER NOT NULL,
                    assigned_worker_id INTEGER,
                    date_worker_assigned INTEGER,
                    handled INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS {history} (
                    message_id TEXT PRIMARY KEY,
                    inbox_uri TEXT NOT NULL,
                    date_started INTEGER NOT NULL,
                    date_completed INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS {deferred} (
                    message_id TEXT PRIMARY KEY,
                    blocking_message_id TEXT NOT NULL,
                    body BLOB NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_{deferred}_blocking
                    ON {deferred}(blocking_message_id);
                CREATE INDEX IF NOT EXISTS idx_{claim}_inbox
                    ON {claim}(inbox_uri);
                "#,
                claim = tables.claim,
                history = tables.history,
                deferred = tables.deferred,
            ))
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT INTO schema_version (namespace, version) VALUES (?1, ?2) \
             ON CONFLICT(namespace) DO UPDATE SET version = excluded.version",
            params![namespace, CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("record schema version", e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl IdempotenceRepository for SqliteRepository {
    async fn try_claim(
        &self,
        message_id: &MessageId,
        inbox_uri: &str,
        worker_id: WorkerId,
    ) -> Result<ProcessingStatus, RepositoryError> {
        self.try_claim_impl(message_id, inbox_uri, worker_id).await
    }

    async fn mark_handled(&self, message_id: &MessageId) -> Result<(), RepositoryError> {
        self.mark_handled_impl(message_id).await
    }

    async fn finalize(&self, message_id: &MessageId) -> Result<(), RepositoryError> {
        self.finalize_impl(message_id).await
    }

    async fn contains(&self, message_id: &MessageId) -> Result<bool, RepositoryError> {
        self.contains_impl(message_id).await
    }

    async fn add_deferred(
        &self,
        blocking_message_id: &MessageId,
        deferred_message_id: &MessageId,
        body: &[u8],
    ) -> Result<(), RepositoryError> {
        self.add_deferred_impl(blocking_message_id, deferred_message_id, body)
            .await
    }

    async fn deferred_messages(
        &self,
        blocking_message_id: &MessageId,
    ) -> Result<Vec<DeferredMessage>, RepositoryError> {
        self.deferred_messages_impl(blocking_message_id).await
    }

    async fn remove_deferred(
        &self,
        deferred_message_id: &MessageId,
    ) -> Result<(), RepositoryError> {
        self.remove_deferred_impl(deferred_message_id).await
    }

    async fn initialize(&self, inbox_uri: &str) -> Result<(), RepositoryError> {
        self.initialize_impl(inbox_uri).await
    }
}
