use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use branchledger_core::{BranchId, TransactionRef};

use crate::event::Event;

/// One audit record: a batch event plus the stream position it was stored at.
///
/// Streams are keyed by transaction reference. `sequence` is the batch
/// version right after the event was applied, so consumers can drop
/// duplicates and detect gaps per reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    transaction_ref: TransactionRef,
    /// Branch that originated the transaction.
    branch_id: BranchId,
    event_type: String,
    schema_version: u32,
    sequence: u64,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap a batch event stored at `sequence`; type, schema and time come
    /// from the event itself.
    pub fn wrap(transaction_ref: TransactionRef, branch_id: BranchId, sequence: u64, event: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            transaction_ref,
            branch_id,
            event_type: event.event_type().to_string(),
            schema_version: event.schema_version(),
            sequence,
            occurred_at: event.occurred_at(),
            payload: event,
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn transaction_ref(&self) -> &TransactionRef {
        &self.transaction_ref
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
