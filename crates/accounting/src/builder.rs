//! Rule entry builder: resolved determinations -> balanced entry batch.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use branchledger_core::{
    AccountCode, AttributeCode, BranchId, Direction, DomainError, EventCode, RuleId,
    TransactionRef,
};

use crate::error::{PostingError, PostingResult};
use crate::formula::Variables;
use crate::registry::{BranchSide, EntryType};
use crate::resolver::{LegAmount, Resolution, Resolver};

/// Inbound request to post one business event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingRequest {
    pub event: EventCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<AttributeCode>,
    pub amount: i64,
    pub source_branch: BranchId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_branch: Option<BranchId>,
    pub reference: TransactionRef,
    /// Component values for formulas; `amount` is always taken from the request.
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PostingRequest {
    pub fn new(
        event: EventCode,
        amount: i64,
        source_branch: BranchId,
        reference: TransactionRef,
    ) -> Self {
        Self {
            event,
            attribute: None,
            amount,
            source_branch,
            destination_branch: None,
            reference,
            variables: Variables::with_amount(amount),
            description: None,
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeCode) -> Self {
        self.attribute = Some(attribute);
        self
    }

    pub fn with_destination(mut self, branch: BranchId) -> Self {
        self.destination_branch = Some(branch);
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn input_variables(&self) -> Variables {
        Variables {
            amount: self.amount,
            ..self.variables.clone()
        }
    }
}

/// One concrete ledger line of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryLine {
    /// 1-based position in the batch.
    pub line_no: u32,
    /// Template leg number, `0` outside templates.
    pub leg_number: u32,
    pub rule: RuleId,
    pub event: EventCode,
    pub branch: BranchId,
    pub account: AccountCode,
    pub direction: Direction,
    pub amount: i64,
    pub description: String,
}

/// Ordered, balanced set of lines sharing one transaction reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBatch {
    pub reference: TransactionRef,
    pub rule: RuleId,
    pub event: EventCode,
    pub entry_type: EntryType,
    pub source_branch: BranchId,
    pub destination_branch: Option<BranchId>,
    pub inter_branch: bool,
    pub double_validation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversal_of: Option<TransactionRef>,
    pub lines: Vec<EntryLine>,
}

impl EntryBatch {
    pub fn debit_total(&self) -> i128 {
        self.total(Direction::Debit)
    }

    pub fn credit_total(&self) -> i128 {
        self.total(Direction::Credit)
    }

    fn total(&self, direction: Direction) -> i128 {
        self.lines
            .iter()
            .filter(|l| l.direction == direction)
            .map(|l| l.amount as i128)
            .sum()
    }

    pub fn is_balanced(&self) -> bool {
        self.debit_total() == self.credit_total()
    }

    /// Every branch touched by the batch.
    pub fn branches(&self) -> BTreeSet<BranchId> {
        self.lines.iter().map(|l| l.branch.clone()).collect()
    }

    pub fn lines_for<'a>(&'a self, branch: &'a BranchId) -> impl Iterator<Item = &'a EntryLine> + 'a {
        self.lines.iter().filter(move |l| &l.branch == branch)
    }

    /// Branches whose approval is needed before the batch may post.
    ///
    /// | flags                          | required             |
    /// |--------------------------------|----------------------|
    /// | single-branch                  | none                 |
    /// | single-branch + double         | source               |
    /// | inter-branch                   | destination          |
    /// | inter-branch + double          | source, destination  |
    ///
    /// Reversals of confirmed batches never need acknowledgement.
    pub fn required_acknowledgers(&self) -> Vec<BranchId> {
        if self.reversal_of.is_some() {
            return Vec::new();
        }
        let mut required = Vec::new();
        if self.double_validation {
            required.push(self.source_branch.clone());
        }
        if self.inter_branch {
            if let Some(dest) = &self.destination_branch {
                if dest != &self.source_branch {
                    required.push(dest.clone());
                }
            }
        }
        required
    }

    /// The exact negation of this batch under a new reference.
    pub fn reversal(&self) -> Result<EntryBatch, DomainError> {
        Ok(EntryBatch {
            reference: TransactionRef::reversal_of(&self.reference)?,
            reversal_of: Some(self.reference.clone()),
            lines: self
                .lines
                .iter()
                .map(|l| EntryLine {
                    direction: l.direction.opposite(),
                    description: format!("reversal of {}: {}", self.reference, l.description),
                    ..l.clone()
                })
                .collect(),
            ..self.clone()
        })
    }
}

/// Builds balanced entry batches from one registry snapshot.
#[derive(Debug, Clone, Copy)]
pub struct EntryBuilder<'a> {
    resolver: Resolver<'a>,
}

/// One pending evaluation in a chain.
struct Step {
    event: EventCode,
    attribute: Option<AttributeCode>,
    vars: Variables,
}

impl<'a> EntryBuilder<'a> {
    pub fn new(resolver: Resolver<'a>) -> Self {
        Self { resolver }
    }

    /// Translate a request into a balanced batch.
    ///
    /// Chained rules are followed in order and their lines appended to the
    /// same batch. Nothing is returned unless every step and the batch as a
    /// whole balance exactly.
    pub fn build(&self, request: &PostingRequest) -> PostingResult<EntryBatch> {
        request.reference.ensure_submittable()?;
        if request.amount <= 0 {
            return Err(DomainError::validation(format!(
                "amount must be positive (got {})",
                request.amount
            ))
            .into());
        }

        let head = self
            .resolver
            .resolve(&request.event, request.attribute.as_ref(), &request.source_branch)?;
        if head.rule.inter_branch {
            match &request.destination_branch {
                Some(dest) if dest != &request.source_branch => {}
                Some(_) => {
                    return Err(DomainError::validation(
                        "inter-branch transaction needs a destination different from the source",
                    )
                    .into());
                }
                None => {
                    return Err(DomainError::validation(format!(
                        "rule {} is inter-branch and needs a destination branch",
                        head.rule.id
                    ))
                    .into());
                }
            }
        }

        let mut batch = EntryBatch {
            reference: request.reference.clone(),
            rule: head.rule.id.clone(),
            event: request.event.clone(),
            entry_type: head.rule.entry_type,
            source_branch: request.source_branch.clone(),
            destination_branch: request.destination_branch.clone(),
            inter_branch: head.rule.inter_branch,
            double_validation: head.rule.double_validation,
            reversal_of: None,
            lines: Vec::new(),
        };

        let mut visited: Vec<EventCode> = Vec::new();
        let mut next = Some((
            Step {
                event: request.event.clone(),
                attribute: request.attribute.clone(),
                vars: request.input_variables(),
            },
            head,
        ));

        while let Some((step, resolution)) = next.take() {
            if visited.contains(&step.event) {
                let mut path = visited.clone();
                path.push(step.event);
                return Err(PostingError::ChainCycle { path });
            }
            visited.push(step.event.clone());

            let legs = resolution.leg_amounts(&step.vars)?;
            check_balance(&legs)?;

            batch.inter_branch |= resolution.rule.inter_branch;
            batch.double_validation |= resolution.rule.double_validation;
            self.append_lines(&mut batch, request, &resolution, &step, &legs)?;

            if let Some(link) = &resolution.rule.chain {
                let forwarded = chained_amount(&resolution, &legs, link.source_leg)?;
                if forwarded > 0 {
                    let vars = Variables {
                        amount: forwarded,
                        ..step.vars.clone()
                    };
                    let chained = self.resolver.resolve(
                        &link.next_event,
                        link.next_attribute.as_ref(),
                        &request.source_branch,
                    )?;
                    next = Some((
                        Step {
                            event: link.next_event.clone(),
                            attribute: link.next_attribute.clone(),
                            vars,
                        },
                        chained,
                    ));
                }
            }
        }

        if batch.lines.is_empty() {
            return Err(DomainError::validation("entry batch has no non-zero lines").into());
        }
        if !batch.is_balanced() {
            return Err(PostingError::UnbalancedEntry {
                debits: batch.debit_total(),
                credits: batch.credit_total(),
            });
        }
        Ok(batch)
    }

    fn append_lines(
        &self,
        batch: &mut EntryBatch,
        request: &PostingRequest,
        resolution: &Resolution,
        step: &Step,
        legs: &[LegAmount],
    ) -> PostingResult<()> {
        let description = request
            .description
            .clone()
            .unwrap_or_else(|| match &step.attribute {
                Some(attr) => format!("{}/{attr} {}", step.event, request.reference),
                None => format!("{} {}", step.event, request.reference),
            });

        for leg in legs.iter().filter(|l| l.amount != 0) {
            let branch = match leg.side {
                BranchSide::Source => request.source_branch.clone(),
                BranchSide::Destination => {
                    request.destination_branch.clone().ok_or_else(|| {
                        PostingError::from(DomainError::validation(format!(
                            "account {} of rule {} posts to the destination branch but none was given",
                            leg.account, resolution.rule.id
                        )))
                    })?
                }
            };
            let line_no = batch.lines.len() as u32 + 1;
            batch.lines.push(EntryLine {
                line_no,
                leg_number: leg.leg_number,
                rule: resolution.rule.id.clone(),
                event: step.event.clone(),
                branch,
                account: leg.account.clone(),
                direction: leg.direction,
                amount: leg.amount,
                description: description.clone(),
            });
        }
        Ok(())
    }
}

fn check_balance(legs: &[LegAmount]) -> PostingResult<()> {
    let (debits, credits) = legs.iter().fold((0i128, 0i128), |(d, c), leg| match leg.direction {
        Direction::Debit => (d + leg.amount as i128, c),
        Direction::Credit => (d, c + leg.amount as i128),
    });
    if debits == credits {
        Ok(())
    } else {
        Err(PostingError::UnbalancedEntry { debits, credits })
    }
}

/// Amount of the 1-based primary leg forwarded to the next chained event.
fn chained_amount(resolution: &Resolution, legs: &[LegAmount], source_leg: usize) -> PostingResult<i64> {
    let amount = if resolution.template.is_some() {
        let rows: Vec<&LegAmount> = legs
            .iter()
            .filter(|l| l.leg_number as usize == source_leg)
            .collect();
        if rows.is_empty() {
            None
        } else {
            Some(rows.iter().map(|l| l.amount).sum())
        }
    } else {
        legs.iter()
            .take(resolution.primary.len())
            .nth(source_leg.saturating_sub(1))
            .map(|l| l.amount)
    };

    amount.ok_or_else(|| {
        PostingError::configuration(format!(
            "rule {} chains from leg {source_leg} which does not exist",
            resolution.rule.id
        ))
    })
}
