//! Deferred-message buffer operations for the SQLite repository.
//!
//! A handler may postpone a causally dependent message until the message
//! blocking it finishes. Rows live only while the blocking claim is
//! active; the façade re-submits and removes them after finalize. If the
//! process crashes between the read and the removal, the deferred message
//! is re-submitted again later - the claim protocol on the re-submitted
//! message restores the exactly-once guarantee downstream.

use rusqlite::{params, Connection};

use super::{SqliteRepository, Tables};
use crate::message::MessageId;
use crate::repository::{DeferredMessage, RepositoryError};

pub(super) fn add_deferred_sync(
    conn: &Connection,
    tables: &Tables,
    blocking_message_id: &MessageId,
    deferred_message_id: &MessageId,
    body: &[u8],
) -> Result<(), RepositoryError> {
    conn.execute(
        &format!(
            "INSERT INTO {} (message_id, blocking_message_id, body) VALUES (?1, ?2, ?3)",
            tables.deferred
        ),
        params![
            deferred_message_id.to_string(),
            blocking_message_id.to_string(),
            body
        ],
    )
    .map_err(|e| RepositoryError::storage("add deferred message", e.to_string()))?;
    Ok(())
}

pub(super) fn deferred_messages_sync(
    conn: &Connection,
    tables: &Tables,
    blocking_message_id: &MessageId,
) -> Result<Vec<DeferredMessage>, RepositoryError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT message_id, body FROM {} WHERE blocking_message_id = ?1",
            tables.deferred
        ))
        .map_err(|e| RepositoryError::storage("prepare deferred query", e.to_string()))?;

    let rows = stmt
        .query_map(params![blocking_message_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map_err(|e| RepositoryError::storage("query deferred messages", e.to_string()))?;

    let mut messages = Vec::new();
    for row in rows {
        let (id_text, body) =
            row.map_err(|e| RepositoryError::storage("read deferred row", e.to_string()))?;
        let message_id = MessageId::parse(&id_text).map_err(|e| {
            RepositoryError::storage(
                "decode deferred message id",
                format!("{id_text}: {e}"),
            )
        })?;
        messages.push(DeferredMessage { message_id, body });
    }
    Ok(messages)
}

pub(super) fn remove_deferred_sync(
    conn: &Connection,
    tables: &Tables,
    deferred_message_id: &MessageId,
) -> Result<(), RepositoryError> {
    conn.execute(
        &format!("DELETE FROM {} WHERE message_id = ?1", tables.deferred),
        params![deferred_message_id.to_string()],
    )
    .map_err(|e| RepositoryError::storage("remove deferred message", e.to_string()))?;
    Ok(())
}

// =============================================================================
// Async wrappers
// =============================================================================

impl SqliteRepository {
    pub(super) async fn add_deferred_impl(
        &self,
        blocking_message_id: &MessageId,
        deferred_message_id: &MessageId,
        body: &[u8],
    ) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        let blocking_message_id = *blocking_message_id;
        let deferred_message_id = *deferred_message_id;
        let body = body.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            add_deferred_sync(&conn, &tables, &blocking_message_id, &deferred_message_id, &body)
        })
        .await
        .map_err(|e| RepositoryError::storage("add_deferred", e.to_string()))?
    }

    pub(super) async fn deferred_messages_impl(
        &self,
        blocking_message_id: &MessageId,
    ) -> Result<Vec<DeferredMessage>, RepositoryError> {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        let blocking_message_id = *blocking_message_id;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            deferred_messages_sync(&conn, &tables, &blocking_message_id)
        })
        .await
        .map_err(|e| RepositoryError::storage("deferred_messages", e.to_string()))?
    }

    pub(super) async fn remove_deferred_impl(
        &self,
        deferred_message_id: &MessageId,
    ) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        let deferred_message_id = *deferred_message_id;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            remove_deferred_sync(&conn, &tables, &deferred_message_id)
        })
        .await
        .map_err(|e| RepositoryError::storage("remove_deferred", e.to_string()))?
    }
}
