//! Repository abstraction for idempotence state persistence.
//!
//! This module defines the `IdempotenceRepository` trait that abstracts
//! storage of the claim protocol's state: active claims, the completed
//! history, and the deferred-message buffer. Implementations provide
//! different backends (in-memory, SQLite).

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{MessageId, WorkerId};

/// Decision of the claim protocol for one inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Duplicate delivery: already fully processed, or another worker owns
    /// the claim right now. The pipeline drops the message.
    Ignore,
    /// This worker now owns the claim and should run the business handler.
    Assigned,
    /// The handler already completed in a previous delivery but the claim
    /// was never finalized (crash between handled and finalized). Skip the
    /// handler, still finalize.
    AlreadyHandled,
}

/// A message whose handling was postponed behind another in-flight message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredMessage {
    /// The deferred message's own id.
    pub message_id: MessageId,
    /// Raw bytes of the deferred transport message.
    pub body: Vec<u8>,
}

/// Errors surfaced by repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The backend is unavailable or a statement/transaction failed.
    /// Nothing was committed, so the whole operation is safe to retry.
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    /// A concurrent worker inserted the claim row first. The claim protocol
    /// recovers from this locally by returning [`ProcessingStatus::Ignore`];
    /// it never escapes `try_claim`.
    #[error("lost claim race for message {0}")]
    DuplicateClaimRace(MessageId),

    /// Invalid endpoint configuration. Fatal at construction: the endpoint
    /// must refuse to start.
    #[error("idempotence endpoint misconfigured: {0}")]
    Misconfigured(String),
}

impl RepositoryError {
    pub(crate) fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub(crate) fn misconfigured(message: impl Into<String>) -> Self {
        Self::Misconfigured(message.into())
    }
}

/// Repository trait for the exactly-once claim protocol.
///
/// Multiple workers invoke these operations concurrently against the same
/// backing store with no in-process coordination; the backend's
/// transactional guarantees are the only synchronization. Each operation
/// runs inside exactly one store transaction.
#[async_trait]
pub trait IdempotenceRepository: Send + Sync {
    /// Decide whether `message_id` should be processed now, ignored as a
    /// duplicate, or treated as already-handled-but-not-finalized.
    ///
    /// First worker to own the claim row wins; ties are broken by the
    /// backend's uniqueness constraint on the message id, never by
    /// application-level locking.
    async fn try_claim(
        &self,
        message_id: &MessageId,
        inbox_uri: &str,
        worker_id: WorkerId,
    ) -> Result<ProcessingStatus, RepositoryError>;

    /// Record that the business handler completed successfully.
    ///
    /// Called before `finalize`; closes the crash window between "handler
    /// ran" and "claim finalized".
    async fn mark_handled(&self, message_id: &MessageId) -> Result<(), RepositoryError>;

    /// Move the active claim to the permanent history.
    ///
    /// Idempotent: a second call for the same message id is a no-op.
    async fn finalize(&self, message_id: &MessageId) -> Result<(), RepositoryError>;

    /// Whether the message is known at all, as an active claim or in the
    /// history. Diagnostic probe; not part of the claim decision.
    async fn contains(&self, message_id: &MessageId) -> Result<bool, RepositoryError>;

    /// Buffer a message behind the in-flight message that must finish first.
    async fn add_deferred(
        &self,
        blocking_message_id: &MessageId,
        deferred_message_id: &MessageId,
        body: &[u8],
    ) -> Result<(), RepositoryError>;

    /// All messages currently deferred behind `blocking_message_id`, in
    /// unspecified order. Does not delete them.
    async fn deferred_messages(
        &self,
        blocking_message_id: &MessageId,
    ) -> Result<Vec<DeferredMessage>, RepositoryError>;

    /// Delete one deferred message by its own id. No-op if absent.
    async fn remove_deferred(&self, deferred_message_id: &MessageId)
        -> Result<(), RepositoryError>;

    /// Repair claim state for `inbox_uri` after an unclean shutdown.
    ///
    /// Runs once at endpoint startup, before any claim traffic for the
    /// endpoint: discards unhandled claims and their deferred dependents,
    /// and clears stale worker assignments on the claims that survive.
    async fn initialize(&self, inbox_uri: &str) -> Result<(), RepositoryError>;
}
