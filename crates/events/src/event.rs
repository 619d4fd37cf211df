//! Contract for messages carried on the audit stream.

use chrono::{DateTime, Utc};

/// Immutable fact about a batch, published after it has been stored.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted name such as `posting.batch.confirmed`; consumers route on it.
    fn event_type(&self) -> &'static str;

    /// Payload schema revision, bumped when a variant's fields change.
    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc>;
}
