//! Exactly-once delivery guard for message-processing endpoints.
//!
//! Given a stream of messages that may be redelivered (retries, crashes,
//! duplicate transport delivery), this crate guarantees that the side
//! effects of handling any given message occur at most once, even when
//! multiple workers concurrently pull from the same inbox.
//!
//! Three components back the guarantee, all persisted in SQLite:
//! - the **claim protocol** ([`repository::IdempotenceRepository`]):
//!   decides per delivery whether to process, ignore as a duplicate, or
//!   treat as already-handled-but-not-finalized;
//! - the **deferred-message buffer**: lets a handler postpone causally
//!   dependent messages until the message blocking them finishes;
//! - the **recovery initializer**: repairs claim state left behind by an
//!   unclean shutdown.
//!
//! [`IdempotenceService`] combines the three into the surface the outer
//! pipeline calls.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use inbox_idempotence::{
//!     IdempotenceConfig, IdempotenceService, MessageId, ProcessingStatus, SqliteRepository,
//!     WorkerId,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IdempotenceConfig::new("endpoint.db", "orders");
//! let service = IdempotenceService::new(Arc::new(SqliteRepository::new(&config)?));
//!
//! service.startup("queue://orders").await?;
//!
//! let message_id = MessageId::new();
//! match service
//!     .processing_status(&message_id, "queue://orders", WorkerId(1))
//!     .await?
//! {
//!     ProcessingStatus::Assigned => { /* run the handler */ }
//!     ProcessingStatus::AlreadyHandled => { /* skip the handler, still finalize */ }
//!     ProcessingStatus::Ignore => { /* drop the duplicate */ }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod message;
pub mod repository;
pub mod service;

pub use config::IdempotenceConfig;
pub use message::{MessageId, WorkerId};
pub use repository::{
    DeferredMessage, IdempotenceRepository, InMemoryRepository, ProcessingStatus, RepositoryError,
    SqliteRepository,
};
pub use service::{IdempotenceService, InboxSubmitter, ServiceError, SubmitError};
