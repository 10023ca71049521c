use std::env;
use std::path::PathBuf;

use crate::repository::RepositoryError;

/// Namespace used when none is configured, mirroring the conventional
/// default schema of the backing store.
pub const DEFAULT_NAMESPACE: &str = "idempotence";

/// Configuration for an idempotence endpoint.
///
/// The only cross-cutting configuration is the connection identity (the
/// database path) and the namespace. The namespace becomes a table-name
/// prefix, isolating multiple endpoints sharing one database file.
#[derive(Debug, Clone)]
pub struct IdempotenceConfig {
    /// Path to the SQLite database file. `":memory:"` yields an ephemeral
    /// database, useful in tests.
    pub database_path: PathBuf,
    /// Table-name prefix for this endpoint's claim and deferred-message
    /// tables. Must be a valid identifier (`[A-Za-z_][A-Za-z0-9_]*`).
    pub namespace: String,
}

impl IdempotenceConfig {
    pub fn new(database_path: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            namespace: namespace.into(),
        }
    }

    /// Build configuration from the environment.
    ///
    /// `IDEMPOTENCE_DB_PATH` is required; `IDEMPOTENCE_NAMESPACE` defaults
    /// to [`DEFAULT_NAMESPACE`].
    pub fn from_env() -> Result<Self, RepositoryError> {
        let database_path = env::var("IDEMPOTENCE_DB_PATH").map(PathBuf::from).map_err(|_| {
            RepositoryError::misconfigured("IDEMPOTENCE_DB_PATH environment variable is required")
        })?;

        let namespace =
            env::var("IDEMPOTENCE_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());

        let config = Self {
            database_path,
            namespace,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, failing fast with
    /// [`RepositoryError::Misconfigured`].
    ///
    /// The namespace check doubles as an injection guard: table names are
    /// interpolated into SQL and must never contain anything beyond
    /// identifier characters.
    pub fn validate(&self) -> Result<(), RepositoryError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(RepositoryError::misconfigured(
                "database path must not be empty",
            ));
        }

        if self.namespace.trim().is_empty() {
            return Err(RepositoryError::misconfigured("namespace must not be empty"));
        }

        let mut chars = self.namespace.chars();
        let first_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !first_ok || !rest_ok {
            return Err(RepositoryError::misconfigured(format!(
                "namespace '{}' must be an identifier ([A-Za-z_][A-Za-z0-9_]*)",
                self.namespace
            )));
        }

        Ok(())
    }
}
