//! In-memory implementation of `IdempotenceRepository`.
//!
//! All claim state is held in memory and lost on restart, so the
//! crash-recovery guarantees of the SQLite backend do not apply. Intended
//! for tests and ephemeral endpoints.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DeferredMessage, IdempotenceRepository, ProcessingStatus, RepositoryError};
use crate::message::{MessageId, WorkerId};

#[derive(Debug, Clone)]
struct ClaimRow {
    inbox_uri: String,
    date_started: i64,
    assigned_worker_id: Option<i64>,
    #[allow(dead_code)]
    date_worker_assigned: Option<i64>,
    handled: bool,
}

// Carries the same columns as the persistent history table even though
// only row existence feeds the claim decision.
#[allow(dead_code)]
#[derive(Debug, Clone)]
struct HistoryRow {
    inbox_uri: String,
    date_started: i64,
    date_completed: i64,
}

#[derive(Debug, Clone)]
struct DeferredRow {
    blocking_message_id: MessageId,
    body: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    claims: HashMap<MessageId, ClaimRow>,
    history: HashMap<MessageId, HistoryRow>,
    deferred: HashMap<MessageId, DeferredRow>,
}

/// In-memory idempotence repository.
///
/// A single `RwLock` guards all three row sets: `finalize` must move a row
/// from the claims map to the history map atomically with respect to
/// concurrent `try_claim` calls.
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Get current unix timestamp in seconds.
    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotenceRepository for InMemoryRepository {
    async fn try_claim(
        &self,
        message_id: &MessageId,
        inbox_uri: &str,
        worker_id: WorkerId,
    ) -> Result<ProcessingStatus, RepositoryError> {
        let mut inner = self.inner.write().await;

        if inner.history.contains_key(message_id) {
            return Ok(ProcessingStatus::Ignore);
        }

        let now = Self::now_secs();
        match inner.claims.entry(*message_id) {
            Entry::Occupied(mut entry) => {
                let row = entry.get_mut();
                if row.assigned_worker_id.is_some() {
                    return Ok(ProcessingStatus::Ignore);
                }
                row.assigned_worker_id = Some(worker_id.0);
                row.date_worker_assigned = Some(now);
                Ok(if row.handled {
                    ProcessingStatus::AlreadyHandled
                } else {
                    ProcessingStatus::Assigned
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(ClaimRow {
                    inbox_uri: inbox_uri.to_string(),
                    date_started: now,
                    assigned_worker_id: Some(worker_id.0),
                    date_worker_assigned: Some(now),
                    handled: false,
                });
                Ok(ProcessingStatus::Assigned)
            }
        }
    }

    async fn mark_handled(&self, message_id: &MessageId) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.claims.get_mut(message_id) {
            row.handled = true;
        }
        Ok(())
    }

    async fn finalize(&self, message_id: &MessageId) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.claims.remove(message_id) {
            inner.history.insert(
                *message_id,
                HistoryRow {
                    inbox_uri: row.inbox_uri,
                    date_started: row.date_started,
                    date_completed: Self::now_secs(),
                },
            );
        }
        Ok(())
    }

    async fn contains(&self, message_id: &MessageId) -> Result<bool, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.claims.contains_key(message_id) || inner.history.contains_key(message_id))
    }

    async fn add_deferred(
        &self,
        blocking_message_id: &MessageId,
        deferred_message_id: &MessageId,
        body: &[u8],
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.deferred.insert(
            *deferred_message_id,
            DeferredRow {
                blocking_message_id: *blocking_message_id,
                body: body.to_vec(),
            },
        );
        Ok(())
    }

    async fn deferred_messages(
        &self,
        blocking_message_id: &MessageId,
    ) -> Result<Vec<DeferredMessage>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .deferred
            .iter()
            .filter(|(_, row)| row.blocking_message_id == *blocking_message_id)
            .map(|(id, row)| DeferredMessage {
                message_id: *id,
                body: row.body.clone(),
            })
            .collect())
    }

    async fn remove_deferred(
        &self,
        deferred_message_id: &MessageId,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.deferred.remove(deferred_message_id);
        Ok(())
    }

    async fn initialize(&self, inbox_uri: &str) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;

        let stale: Vec<MessageId> = inner
            .claims
            .iter()
            .filter(|(_, row)| row.inbox_uri == inbox_uri && !row.handled)
            .map(|(id, _)| *id)
            .collect();

        inner
            .deferred
            .retain(|_, row| !stale.contains(&row.blocking_message_id));
        for id in &stale {
            inner.claims.remove(id);
        }

        for row in inner
            .claims
            .values_mut()
            .filter(|row| row.inbox_uri == inbox_uri)
        {
            row.assigned_worker_id = None;
            row.date_worker_assigned = None;
        }

        Ok(())
    }
}
