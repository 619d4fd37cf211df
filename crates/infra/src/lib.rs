//! Infrastructure layer: stores, branch gateway, acknowledgement dispatch and
//! the async posting engine that ties them to the pure accounting crate.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod reconciliation;
pub mod retry;
pub mod store;

pub use config::{ConfigError, EngineConfig};
pub use dispatcher::AcknowledgementDispatcher;
pub use engine::{PostingEngine, SubmitOutcome, SweepReport};
pub use error::{EngineError, StoreError};
pub use gateway::{AcknowledgementRequest, BranchGateway, GatewayError, InMemoryBranchGateway};
pub use reconciliation::{ReconciliationNotice, SweeperHandle, SweeperStats};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{
    InMemoryLedgerStore, InMemoryStagedBatchStore, LedgerStore, PostgresLedgerStore,
    PostgresStagedBatchStore, StagedBatchStore,
};

use std::sync::Arc;

use branchledger_accounting::{BatchEvent, RuleRegistry};
use branchledger_events::{EventEnvelope, InMemoryEventBus};

/// Engine wired entirely to in-process adapters (tests, local runs).
pub type InMemoryPostingEngine = PostingEngine<
    InMemoryStagedBatchStore,
    InMemoryLedgerStore,
    InMemoryBranchGateway,
    InMemoryEventBus<EventEnvelope<BatchEvent>>,
    InMemoryEventBus<ReconciliationNotice>,
>;

impl InMemoryPostingEngine {
    pub fn in_memory(registry: RuleRegistry, config: EngineConfig) -> Self {
        PostingEngine::new(
            registry,
            Arc::new(InMemoryStagedBatchStore::new()),
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryBranchGateway::new()),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(InMemoryEventBus::new()),
            config,
        )
    }
}
