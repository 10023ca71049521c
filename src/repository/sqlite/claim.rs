//! Claim protocol operations for the SQLite repository.
//!
//! The protocol decides, inside one transaction, whether an inbound
//! delivery should be processed, ignored as a duplicate, or treated as
//! already-handled-but-not-finalized:
//! - a history row means the message was fully processed in a previous
//!   delivery,
//! - an owned claim row means another worker is processing it right now,
//! - otherwise this worker takes ownership, guarded by the primary key on
//!   the message id.
//!
//! First worker to own the row wins; ties are broken by the uniqueness
//! constraint, never by application-level locking.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use super::{SqliteRepository, Tables};
use crate::message::{MessageId, WorkerId};
use crate::repository::{ProcessingStatus, RepositoryError};

/// True when the backend reports a uniqueness-constraint conflict.
///
/// Classification is structural (the driver's error code), never a match
/// on the error message text.
pub(super) fn is_duplicate_key(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Run the claim decision for one inbound delivery.
pub(super) fn try_claim_sync(
    conn: &mut Connection,
    tables: &Tables,
    message_id: &MessageId,
    inbox_uri: &str,
    worker_id: WorkerId,
) -> Result<ProcessingStatus, RepositoryError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| RepositoryError::storage("begin claim transaction", e.to_string()))?;

    // A history row is definitive proof of prior processing.
    let in_history: bool = tx
        .query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE message_id = ?1)",
                tables.history
            ),
            params![message_id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| RepositoryError::storage("check processing history", e.to_string()))?;
    if in_history {
        return Ok(ProcessingStatus::Ignore);
    }

    let existing: Option<(Option<i64>, bool)> = tx
        .query_row(
            &format!(
                "SELECT assigned_worker_id, handled FROM {} WHERE message_id = ?1",
                tables.claim
            ),
            params![message_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| RepositoryError::storage("read claim", e.to_string()))?;

    let handled = match existing {
        // Another worker owns this message right now.
        Some((Some(_), _)) => return Ok(ProcessingStatus::Ignore),
        // Registered but unowned: either recovery cleared the assignment on
        // a handled claim, or a registration raced. Adopt it; the IS NULL
        // guard loses gracefully if another worker adopted it since the
        // read above.
        Some((None, _)) => {
            let adopted = tx
                .execute(
                    &format!(
                        "UPDATE {} SET assigned_worker_id = ?1, \
                         date_worker_assigned = unixepoch() \
                         WHERE message_id = ?2 AND assigned_worker_id IS NULL",
                        tables.claim
                    ),
                    params![worker_id.0, message_id.to_string()],
                )
                .map_err(|e| RepositoryError::storage("adopt claim", e.to_string()))?;
            if adopted == 0 {
                return Ok(ProcessingStatus::Ignore);
            }
            tx.query_row(
                &format!("SELECT handled FROM {} WHERE message_id = ?1", tables.claim),
                params![message_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| RepositoryError::storage("read handled flag", e.to_string()))?
        }
        // No claim yet: register one owned by this worker. The primary key
        // is the tie-break for the inherent race between the read above and
        // this insert.
        None => {
            match tx.execute(
                &format!(
                    "INSERT INTO {} (message_id, inbox_uri, date_started, \
                     assigned_worker_id, date_worker_assigned, handled) \
                     VALUES (?1, ?2, unixepoch(), ?3, unixepoch(), 0)",
                    tables.claim
                ),
                params![message_id.to_string(), inbox_uri, worker_id.0],
            ) {
                Ok(_) => false,
                Err(e) if is_duplicate_key(&e) => {
                    let race = RepositoryError::DuplicateClaimRace(*message_id);
                    debug!(%message_id, %worker_id, "{race}");
                    return Ok(ProcessingStatus::Ignore);
                }
                Err(e) => {
                    return Err(RepositoryError::storage("register claim", e.to_string()))
                }
            }
        }
    };

    tx.commit()
        .map_err(|e| RepositoryError::storage("commit claim transaction", e.to_string()))?;

    Ok(if handled {
        ProcessingStatus::AlreadyHandled
    } else {
        ProcessingStatus::Assigned
    })
}

/// Record that the business handler completed successfully.
pub(super) fn mark_handled_sync(
    conn: &Connection,
    tables: &Tables,
    message_id: &MessageId,
) -> Result<(), RepositoryError> {
    let updated = conn
        .execute(
            &format!("UPDATE {} SET handled = 1 WHERE message_id = ?1", tables.claim),
            params![message_id.to_string()],
        )
        .map_err(|e| RepositoryError::storage("mark handled", e.to_string()))?;

    if updated == 0 {
        // Tolerated: the claim may already have been finalized by a
        // duplicate pipeline invocation.
        warn!(%message_id, "mark_handled found no active claim");
    }
    Ok(())
}

/// Move the active claim to the permanent history.
///
/// Idempotent: when no active claim exists (already finalized), both
/// statements affect zero rows and the call is a no-op.
pub(super) fn finalize_sync(
    conn: &mut Connection,
    tables: &Tables,
    message_id: &MessageId,
) -> Result<(), RepositoryError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| RepositoryError::storage("begin finalize transaction", e.to_string()))?;

    let copied = tx
        .execute(
            &format!(
                "INSERT INTO {history} (message_id, inbox_uri, date_started, date_completed) \
                 SELECT message_id, inbox_uri, date_started, unixepoch() \
                 FROM {claim} WHERE message_id = ?1",
                history = tables.history,
                claim = tables.claim,
            ),
            params![message_id.to_string()],
        )
        .map_err(|e| RepositoryError::storage("copy claim to history", e.to_string()))?;

    if copied > 0 {
        tx.execute(
            &format!("DELETE FROM {} WHERE message_id = ?1", tables.claim),
            params![message_id.to_string()],
        )
        .map_err(|e| RepositoryError::storage("delete finalized claim", e.to_string()))?;
    }

    tx.commit()
        .map_err(|e| RepositoryError::storage("commit finalize transaction", e.to_string()))
}

/// Existence probe across active claims and history.
pub(super) fn contains_sync(
    conn: &Connection,
    tables: &Tables,
    message_id: &MessageId,
) -> Result<bool, RepositoryError> {
    conn.query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM {claim} WHERE message_id = ?1) \
             OR EXISTS(SELECT 1 FROM {history} WHERE message_id = ?1)",
            claim = tables.claim,
            history = tables.history,
        ),
        params![message_id.to_string()],
        |row| row.get(0),
    )
    .map_err(|e| RepositoryError::storage("contains", e.to_string()))
}

// =============================================================================
// Async wrappers
// =============================================================================

impl SqliteRepository {
    pub(super) async fn try_claim_impl(
        &self,
        message_id: &MessageId,
        inbox_uri: &str,
        worker_id: WorkerId,
    ) -> Result<ProcessingStatus, RepositoryError> {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        let message_id = *message_id;
        let inbox_uri = inbox_uri.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            try_claim_sync(&mut conn, &tables, &message_id, &inbox_uri, worker_id)
        })
        .await
        .map_err(|e| RepositoryError::storage("try_claim", e.to_string()))?
    }

    pub(super) async fn mark_handled_impl(
        &self,
        message_id: &MessageId,
    ) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        let message_id = *message_id;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            mark_handled_sync(&conn, &tables, &message_id)
        })
        .await
        .map_err(|e| RepositoryError::storage("mark_handled", e.to_string()))?
    }

    pub(super) async fn finalize_impl(
        &self,
        message_id: &MessageId,
    ) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        let message_id = *message_id;

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            finalize_sync(&mut conn, &tables, &message_id)
        })
        .await
        .map_err(|e| RepositoryError::storage("finalize", e.to_string()))?
    }

    pub(super) async fn contains_impl(
        &self,
        message_id: &MessageId,
    ) -> Result<bool, RepositoryError> {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        let message_id = *message_id;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            contains_sync(&conn, &tables, &message_id)
        })
        .await
        .map_err(|e| RepositoryError::storage("contains", e.to_string()))?
    }
}
