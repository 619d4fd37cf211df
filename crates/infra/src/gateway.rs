//! Outbound port to counter-branches.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use branchledger_accounting::{EntryTempData, StagedBatch};
use branchledger_core::{BranchId, TransactionRef};

/// Request sent to a branch asking it to acknowledge its share of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgementRequest {
    pub reference: TransactionRef,
    pub originating_branch: BranchId,
    pub branch: BranchId,
    /// Staged lines the target branch is asked to approve.
    pub lines: Vec<EntryTempData>,
    pub requested_at: DateTime<Utc>,
}

impl AcknowledgementRequest {
    /// Request for `branch`, or `None` if the batch is not staged.
    pub fn for_branch(staged: &StagedBatch, branch: &BranchId, at: DateTime<Utc>) -> Option<Self> {
        let originating_branch = staged.originating_branch()?.clone();
        Some(Self {
            reference: staged.reference().clone(),
            originating_branch,
            branch: branch.clone(),
            lines: staged
                .rows()
                .iter()
                .filter(|row| &row.branch == branch || row.external_branch.as_ref() == Some(branch))
                .cloned()
                .collect(),
            requested_at: at,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Transport-level failure; worth retrying.
    #[error("branch {branch} unreachable: {reason}")]
    Unavailable { branch: BranchId, reason: String },

    /// The branch answered but refused the request.
    #[error("branch {branch} refused acknowledgement request: {reason}")]
    Refused { branch: BranchId, reason: String },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable { .. })
    }
}

/// Delivers acknowledgement requests to remote branches.
#[async_trait::async_trait]
pub trait BranchGateway: Send + Sync {
    async fn request_acknowledgement(&self, request: AcknowledgementRequest) -> Result<(), GatewayError>;
}

/// In-process gateway that records every delivered request.
///
/// Failures can be scripted per branch to exercise retry and reconciliation.
#[derive(Debug, Default)]
pub struct InMemoryBranchGateway {
    delivered: Mutex<Vec<AcknowledgementRequest>>,
    failures: Mutex<HashMap<BranchId, Failure>>,
    attempts: Mutex<HashMap<BranchId, u32>>,
}

#[derive(Debug, Clone)]
enum Failure {
    Transient(u32),
    Unreachable,
    Refuse(String),
}

impl InMemoryBranchGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` deliveries to `branch` with a transient error.
    pub fn fail_next(&self, branch: &BranchId, times: u32) {
        self.set_failure(branch, Failure::Transient(times));
    }

    /// Every delivery to `branch` fails with a transient error until healed.
    pub fn make_unreachable(&self, branch: &BranchId) {
        self.set_failure(branch, Failure::Unreachable);
    }

    pub fn refuse(&self, branch: &BranchId, reason: impl Into<String>) {
        self.set_failure(branch, Failure::Refuse(reason.into()));
    }

    pub fn heal(&self, branch: &BranchId) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(branch);
        }
    }

    pub fn delivered(&self) -> Vec<AcknowledgementRequest> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn delivered_to(&self, branch: &BranchId) -> Vec<AcknowledgementRequest> {
        self.delivered()
            .into_iter()
            .filter(|r| &r.branch == branch)
            .collect()
    }

    /// Delivery attempts made towards `branch`, successful or not.
    pub fn attempts(&self, branch: &BranchId) -> u32 {
        self.attempts
            .lock()
            .map(|a| a.get(branch).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn set_failure(&self, branch: &BranchId, failure: Failure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(branch.clone(), failure);
        }
    }
}

#[async_trait::async_trait]
impl BranchGateway for InMemoryBranchGateway {
    async fn request_acknowledgement(&self, request: AcknowledgementRequest) -> Result<(), GatewayError> {
        let branch = request.branch.clone();
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts.entry(branch.clone()).or_insert(0) += 1;
        }

        let failure = {
            let mut failures = self.failures.lock().map_err(|_| GatewayError::Unavailable {
                branch: branch.clone(),
                reason: "gateway lock poisoned".into(),
            })?;
            match failures.get(&branch).cloned() {
                Some(Failure::Transient(0)) => {
                    failures.remove(&branch);
                    None
                }
                Some(Failure::Transient(remaining)) => {
                    failures.insert(branch.clone(), Failure::Transient(remaining - 1));
                    Some(Failure::Transient(remaining - 1))
                }
                other => other,
            }
        };

        match failure {
            Some(Failure::Transient(_)) | Some(Failure::Unreachable) => Err(GatewayError::Unavailable {
                branch,
                reason: "connection refused".into(),
            }),
            Some(Failure::Refuse(reason)) => Err(GatewayError::Refused { branch, reason }),
            None => {
                if let Ok(mut delivered) = self.delivered.lock() {
                    delivered.push(request);
                }
                Ok(())
            }
        }
    }
}
