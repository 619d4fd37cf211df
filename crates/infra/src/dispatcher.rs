//! Acknowledgement delivery with bounded retry.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use branchledger_accounting::DeliveryOutcome;

use crate::gateway::{AcknowledgementRequest, BranchGateway};
use crate::retry::RetryPolicy;

/// Sends acknowledgement requests through a [`BranchGateway`], retrying
/// transient failures with backoff.
///
/// Holds no batch state; callers record the returned outcome on the batch.
pub struct AcknowledgementDispatcher<G> {
    gateway: Arc<G>,
    policy: RetryPolicy,
}

impl<G> Clone for AcknowledgementDispatcher<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            policy: self.policy.clone(),
        }
    }
}

impl<G> AcknowledgementDispatcher<G>
where
    G: BranchGateway,
{
    pub fn new(gateway: Arc<G>, policy: RetryPolicy) -> Self {
        Self { gateway, policy }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[instrument(skip(self, request), fields(transaction_ref = %request.reference, branch = %request.branch))]
    pub async fn deliver(&self, request: AcknowledgementRequest) -> DeliveryOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.request_acknowledgement(request.clone()).await {
                Ok(()) => {
                    debug!(attempt, "acknowledgement request delivered");
                    return DeliveryOutcome::Delivered;
                }
                Err(err) if err.is_transient() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "delivery failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "giving up on acknowledgement request");
                    return DeliveryOutcome::Failed {
                        attempts: attempt,
                        error: err.to_string(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryBranchGateway;
    use branchledger_core::BranchId;
    use chrono::Utc;
    use std::time::Duration;

    fn request(branch: &BranchId) -> AcknowledgementRequest {
        AcknowledgementRequest {
            reference: "TX-1".parse().unwrap(),
            originating_branch: "BR1".parse().unwrap(),
            branch: branch.clone(),
            lines: Vec::new(),
            requested_at: Utc::now(),
        }
    }

    fn dispatcher(gateway: &Arc<InMemoryBranchGateway>, attempts: u32) -> AcknowledgementDispatcher<InMemoryBranchGateway> {
        AcknowledgementDispatcher::new(Arc::clone(gateway), RetryPolicy::fixed(attempts, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let gateway = Arc::new(InMemoryBranchGateway::new());
        let branch: BranchId = "BR2".parse().unwrap();
        gateway.fail_next(&branch, 2);

        let outcome = dispatcher(&gateway, 3).deliver(request(&branch)).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(gateway.attempts(&branch), 3);
        assert_eq!(gateway.delivered_to(&branch).len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let gateway = Arc::new(InMemoryBranchGateway::new());
        let branch: BranchId = "BR2".parse().unwrap();
        gateway.make_unreachable(&branch);

        let outcome = dispatcher(&gateway, 3).deliver(request(&branch)).await;

        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 3, .. }));
        assert!(gateway.delivered().is_empty());
    }

    #[tokio::test]
    async fn refusals_are_not_retried() {
        let gateway = Arc::new(InMemoryBranchGateway::new());
        let branch: BranchId = "BR2".parse().unwrap();
        gateway.refuse(&branch, "unknown transaction type");

        let outcome = dispatcher(&gateway, 5).deliver(request(&branch)).await;

        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 1, .. }));
        assert_eq!(gateway.attempts(&branch), 1);
    }
}
