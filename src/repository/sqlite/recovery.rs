//! Startup recovery pass for the SQLite repository.
//!
//! Repairs claim state left behind by an unclean shutdown of the same
//! endpoint. Runs before any claim traffic for the endpoint, so it
//! assumes no concurrent claim activity during its own transaction.

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::info;

use super::{SqliteRepository, Tables};
use crate::repository::RepositoryError;

/// Repair claim state for one inbox endpoint.
///
/// Claims that reached `handled` survive (so `AlreadyHandled` can still be
/// returned and finalize still runs); claims that did not are discarded
/// together with their deferred dependents, and the messages will be
/// reprocessed from scratch on redelivery.
pub(super) fn initialize_sync(
    conn: &mut Connection,
    tables: &Tables,
    inbox_uri: &str,
) -> Result<(), RepositoryError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| RepositoryError::storage("begin recovery transaction", e.to_string()))?;

    // Deferred rows behind an interrupted claim cannot be safely released.
    let orphaned_deferred = tx
        .execute(
            &format!(
                "DELETE FROM {deferred} WHERE blocking_message_id IN \
                 (SELECT message_id FROM {claim} WHERE inbox_uri = ?1 AND handled = 0)",
                deferred = tables.deferred,
                claim = tables.claim,
            ),
            params![inbox_uri],
        )
        .map_err(|e| RepositoryError::storage("delete orphaned deferred", e.to_string()))?;

    // Stale in-flight claims from the previous run; they are re-created
    // naturally when the message is redelivered.
    let stale_claims = tx
        .execute(
            &format!(
                "DELETE FROM {} WHERE inbox_uri = ?1 AND handled = 0",
                tables.claim
            ),
            params![inbox_uri],
        )
        .map_err(|e| RepositoryError::storage("delete stale claims", e.to_string()))?;

    // Worker identities from the previous process are meaningless now.
    let cleared_assignments = tx
        .execute(
            &format!(
                "UPDATE {} SET assigned_worker_id = NULL, date_worker_assigned = NULL \
                 WHERE inbox_uri = ?1",
                tables.claim
            ),
            params![inbox_uri],
        )
        .map_err(|e| RepositoryError::storage("clear worker assignments", e.to_string()))?;

    tx.commit()
        .map_err(|e| RepositoryError::storage("commit recovery transaction", e.to_string()))?;

    info!(
        inbox_uri,
        stale_claims, orphaned_deferred, cleared_assignments, "recovered idempotence state"
    );
    Ok(())
}

impl SqliteRepository {
    pub(super) async fn initialize_impl(&self, inbox_uri: &str) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        let inbox_uri = inbox_uri.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            initialize_sync(&mut conn, &tables, &inbox_uri)
        })
        .await
        .map_err(|e| RepositoryError::storage("initialize", e.to_string()))?
    }
}
