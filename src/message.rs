//! Identifier newtypes shared across the claim protocol.

use std::fmt;

use uuid::Uuid;

/// Unique identifier of a transport message.
///
/// Globally unique across endpoints; the claim tables key on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a fresh random message id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a message id from its canonical text form.
    pub fn parse(text: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(text).map(Self)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one concurrent worker within an endpoint process.
///
/// Worker identities are only meaningful for the lifetime of the process
/// that issued them; the recovery pass clears them on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub i64);

impl From<i64> for WorkerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
