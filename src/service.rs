//! Idempotence façade exposed to the message pipeline.
//!
//! The pipeline calls these operations, per inbound message, in this
//! order:
//! 1. [`IdempotenceService::startup`] once at endpoint startup, before
//!    accepting traffic.
//! 2. [`IdempotenceService::processing_status`] before the business
//!    handler runs. `Ignore` drops the message; `Assigned` runs the
//!    handler; `AlreadyHandled` skips the handler.
//! 3. [`IdempotenceService::message_handled`] after the handler succeeds
//!    (skipped on `AlreadyHandled`).
//! 4. [`IdempotenceService::processing_completed`] to finalize the claim
//!    and release any messages deferred behind it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::message::{MessageId, WorkerId};
use crate::repository::{IdempotenceRepository, ProcessingStatus, RepositoryError};

/// Failure reported by an [`InboxSubmitter`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SubmitError(pub String);

/// Transport seam used to re-enqueue deferred messages into the inbox.
///
/// Implemented by the queue transport. Submissions may be duplicated
/// across crashes (at-least-once); the claim protocol on the re-submitted
/// message provides the exactly-once guarantee downstream.
#[async_trait]
pub trait InboxSubmitter: Send + Sync {
    async fn submit(&self, message_id: &MessageId, body: &[u8]) -> Result<(), SubmitError>;
}

/// Errors surfaced by façade operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Re-submission of a deferred message was rejected by the transport.
    /// The remaining deferred rows stay buffered; retrying
    /// `processing_completed` resumes the release (finalize is an
    /// idempotent no-op on the retry).
    #[error("re-submission of deferred message {message_id} failed: {reason}")]
    Resubmit {
        message_id: MessageId,
        reason: String,
    },
}

/// The single public entry point combining the claim store, the
/// deferred-message buffer and the recovery initializer.
pub struct IdempotenceService {
    repository: Arc<dyn IdempotenceRepository>,
}

impl IdempotenceService {
    pub fn new(repository: Arc<dyn IdempotenceRepository>) -> Self {
        Self { repository }
    }

    /// Recovery pass for the endpoint. Call exactly once at startup,
    /// before any claim traffic.
    pub async fn startup(&self, inbox_uri: &str) -> Result<(), RepositoryError> {
        self.repository.initialize(inbox_uri).await
    }

    /// Claim decision for one inbound delivery.
    pub async fn processing_status(
        &self,
        message_id: &MessageId,
        inbox_uri: &str,
        worker_id: WorkerId,
    ) -> Result<ProcessingStatus, RepositoryError> {
        self.repository.try_claim(message_id, inbox_uri, worker_id).await
    }

    /// Record handler success before finalizing. This closes the crash
    /// window between "handler ran" and "claim finalized".
    pub async fn message_handled(&self, message_id: &MessageId) -> Result<(), RepositoryError> {
        self.repository.mark_handled(message_id).await
    }

    /// Postpone `deferred_message_id` until `blocking_message_id` finishes
    /// processing. Call at most once per (blocking, deferred) pair.
    pub async fn defer_message(
        &self,
        blocking_message_id: &MessageId,
        deferred_message_id: &MessageId,
        body: &[u8],
    ) -> Result<(), RepositoryError> {
        self.repository
            .add_deferred(blocking_message_id, deferred_message_id, body)
            .await
    }

    /// Whether the message is known at all, as an active claim or in the
    /// history.
    pub async fn contains(&self, message_id: &MessageId) -> Result<bool, RepositoryError> {
        self.repository.contains(message_id).await
    }

    /// Finalize the claim, then release every message deferred behind it:
    /// re-submit each body through `submitter` and remove the row once the
    /// re-submission was accepted.
    pub async fn processing_completed(
        &self,
        message_id: &MessageId,
        submitter: &dyn InboxSubmitter,
    ) -> Result<(), ServiceError> {
        self.repository.finalize(message_id).await?;

        let deferred = self.repository.deferred_messages(message_id).await?;
        let released = deferred.len();
        for message in deferred {
            submitter
                .submit(&message.message_id, &message.body)
                .await
                .map_err(|e| ServiceError::Resubmit {
                    message_id: message.message_id,
                    reason: e.to_string(),
                })?;
            self.repository.remove_deferred(&message.message_id).await?;
        }

        if released > 0 {
            debug!(blocking_message_id = %message_id, released, "released deferred messages");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    use tokio::sync::Mutex;

    /// Submitter fake that records everything it accepts.
    struct RecordingSubmitter {
        submitted: Mutex<Vec<(MessageId, Vec<u8>)>>,
    }

    impl RecordingSubmitter {
        fn new() -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InboxSubmitter for RecordingSubmitter {
        async fn submit(&self, message_id: &MessageId, body: &[u8]) -> Result<(), SubmitError> {
            self.submitted.lock().await.push((*message_id, body.to_vec()));
            Ok(())
        }
    }

    /// Submitter fake that rejects everything.
    struct FailingSubmitter;

    #[async_trait]
    impl InboxSubmitter for FailingSubmitter {
        async fn submit(&self, _message_id: &MessageId, _body: &[u8]) -> Result<(), SubmitError> {
            Err(SubmitError("queue unavailable".to_string()))
        }
    }

    fn service() -> IdempotenceService {
        IdempotenceService::new(Arc::new(InMemoryRepository::new()))
    }

    #[tokio::test]
    async fn full_pipeline_flow() {
        let service = service();
        let submitter = RecordingSubmitter::new();
        let m1 = MessageId::new();

        service.startup("queue://a").await.unwrap();

        let status = service
            .processing_status(&m1, "queue://a", WorkerId(1))
            .await
            .unwrap();
        assert_eq!(status, ProcessingStatus::Assigned);

        // Concurrent duplicate delivery while the handler runs.
        let dup = service
            .processing_status(&m1, "queue://a", WorkerId(2))
            .await
            .unwrap();
        assert_eq!(dup, ProcessingStatus::Ignore);

        service.message_handled(&m1).await.unwrap();
        service.processing_completed(&m1, &submitter).await.unwrap();

        // Late redelivery after finalize.
        let late = service
            .processing_status(&m1, "queue://a", WorkerId(3))
            .await
            .unwrap();
        assert_eq!(late, ProcessingStatus::Ignore);
    }

    #[tokio::test]
    async fn deferred_messages_are_released_on_completion() {
        let service = service();
        let submitter = RecordingSubmitter::new();
        let m1 = MessageId::new();
        let m2 = MessageId::new();

        service
            .processing_status(&m1, "queue://a", WorkerId(1))
            .await
            .unwrap();
        service.defer_message(&m1, &m2, b"deferred-body").await.unwrap();
        service.message_handled(&m1).await.unwrap();
        service.processing_completed(&m1, &submitter).await.unwrap();

        let submitted = submitter.submitted.lock().await;
        assert_eq!(*submitted, vec![(m2, b"deferred-body".to_vec())]);
    }

    #[tokio::test]
    async fn failed_resubmission_keeps_rows_for_retry() {
        let service = service();
        let m1 = MessageId::new();
        let m2 = MessageId::new();

        service
            .processing_status(&m1, "queue://a", WorkerId(1))
            .await
            .unwrap();
        service.defer_message(&m1, &m2, b"deferred-body").await.unwrap();
        service.message_handled(&m1).await.unwrap();

        let err = service
            .processing_completed(&m1, &FailingSubmitter)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Resubmit { message_id, .. } if message_id == m2));

        // Retrying completes the release; finalize is a no-op the second
        // time around.
        let submitter = RecordingSubmitter::new();
        service.processing_completed(&m1, &submitter).await.unwrap();
        assert_eq!(submitter.submitted.lock().await.len(), 1);

        // Nothing left behind after a successful release.
        service.processing_completed(&m1, &submitter).await.unwrap();
        assert_eq!(submitter.submitted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn already_handled_after_recovery_skips_handler_but_finalizes() {
        let service = service();
        let submitter = RecordingSubmitter::new();
        let m1 = MessageId::new();

        service
            .processing_status(&m1, "queue://a", WorkerId(1))
            .await
            .unwrap();
        service.message_handled(&m1).await.unwrap();

        // Crash before finalize, then restart.
        service.startup("queue://a").await.unwrap();

        let status = service
            .processing_status(&m1, "queue://a", WorkerId(1))
            .await
            .unwrap();
        assert_eq!(status, ProcessingStatus::AlreadyHandled);

        service.processing_completed(&m1, &submitter).await.unwrap();
        let after = service
            .processing_status(&m1, "queue://a", WorkerId(1))
            .await
            .unwrap();
        assert_eq!(after, ProcessingStatus::Ignore);
    }
}
