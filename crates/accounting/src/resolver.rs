//! Account determination: event + attribute + branch -> target accounts.
//!
//! Resolution is a pure read of one registry snapshot, so results may be
//! cached per registry version.

use serde::{Deserialize, Serialize};

use branchledger_core::{
    AccountCode, AttributeCode, BranchId, Direction, EventCode, Percentage, money,
};

use crate::error::{PostingError, PostingResult};
use crate::formula::{Formula, Variables};
use crate::registry::{AccountingRule, AccountingTemplate, BranchSide, RuleRegistry};

/// One resolved target account with its allocation share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountShare {
    pub account: AccountCode,
    pub direction: Direction,
    pub percentage: Percentage,
    /// Explicit amount formula replacing the percentage share.
    pub formula: Option<Formula>,
    pub side: BranchSide,
}

/// A concrete amount for one account, before branch assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegAmount {
    /// Template leg number; `0` for contra legs and flat rules.
    pub leg_number: u32,
    pub account: AccountCode,
    pub direction: Direction,
    pub amount: i64,
    pub side: BranchSide,
}

/// Outcome of resolving one event for one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub rule: AccountingRule,
    pub primary: Vec<AccountShare>,
    pub contra: Vec<AccountShare>,
    pub template: Option<AccountingTemplate>,
}

impl Resolution {
    /// Split the input amount across the resolved accounts.
    ///
    /// Percentage shares are rounded down with the residual on the first
    /// leg; shares carrying a formula take the formula result instead.
    pub fn leg_amounts(&self, vars: &Variables) -> PostingResult<Vec<LegAmount>> {
        if let Some(template) = &self.template {
            return self.template_leg_amounts(template, vars);
        }

        let mut legs = split_shares(&self.primary, vars)?;
        legs.extend(split_shares(&self.contra, vars)?);
        Ok(legs)
    }

    fn template_leg_amounts(
        &self,
        template: &AccountingTemplate,
        vars: &Variables,
    ) -> PostingResult<Vec<LegAmount>> {
        let mut legs = Vec::with_capacity(template.legs.len() + template.contra.len());

        for (_, rows) in template.allocation_groups() {
            let base = match &rows[0].amount_formula {
                Some(formula) => formula.evaluate(vars)?,
                None => vars.amount,
            };
            let shares: Vec<Percentage> = rows.iter().map(|r| r.allocation_percentage).collect();
            let amounts = money::allocate(base, &shares)?;

            for (row, amount) in rows.iter().zip(amounts) {
                legs.push(LegAmount {
                    leg_number: row.leg_number,
                    account: row.account.clone(),
                    direction: row.direction,
                    amount,
                    side: row.branch_side.unwrap_or(BranchSide::Source),
                });
            }
        }

        // contra lines offset the net of the legs
        let net: i128 = legs.iter().map(|l| l.direction.signed(l.amount)).sum();
        if net != 0 && !template.contra.is_empty() {
            let direction = if net > 0 {
                Direction::Credit
            } else {
                Direction::Debit
            };
            let total = i64::try_from(net.unsigned_abs()).map_err(|_| {
                PostingError::formula(template.id.as_str(), "template total out of range")
            })?;
            let shares: Vec<Percentage> = template
                .contra
                .iter()
                .map(|c| c.allocation_percentage)
                .collect();
            let amounts = money::allocate(total, &shares)?;

            for (row, amount) in template.contra.iter().zip(amounts) {
                legs.push(LegAmount {
                    leg_number: 0,
                    account: row.account.clone(),
                    direction,
                    amount,
                    side: row.branch_side.unwrap_or(contra_side(&self.rule)),
                });
            }
        }
        Ok(legs)
    }
}

/// Read-only resolver bound to one registry snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    registry: &'a RuleRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a RuleRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &'a RuleRegistry {
        self.registry
    }

    /// The active rule for `event` on `branch`.
    ///
    /// A rule listing the branch explicitly wins over an all-branches rule.
    pub fn rule_for(&self, event: &EventCode, branch: &BranchId) -> PostingResult<&'a AccountingRule> {
        self.registry
            .candidate_rules(event, branch)
            .into_iter()
            .next()
            .ok_or_else(|| PostingError::RuleNotFound {
                event: event.clone(),
                branch: branch.clone(),
            })
    }

    /// Resolve the primary and contra accounts of an event.
    pub fn resolve(
        &self,
        event: &EventCode,
        attribute: Option<&AttributeCode>,
        branch: &BranchId,
    ) -> PostingResult<Resolution> {
        let rule = self.rule_for(event, branch)?;

        if let Some(template_id) = &rule.template {
            let template = self
                .registry
                .template(template_id)
                .filter(|t| t.active)
                .ok_or_else(|| {
                    PostingError::configuration(format!(
                        "rule {} references missing template {template_id}",
                        rule.id
                    ))
                })?;
            crate::registry::validate_template(template)?;
            return Ok(Resolution {
                rule: rule.clone(),
                primary: Vec::new(),
                contra: Vec::new(),
                template: Some(template.clone()),
            });
        }

        let primary = self.primary_shares(rule, attribute);
        let contra = self.contra_shares(rule, attribute);
        recheck(rule, "determinations", &primary)?;
        recheck(rule, "contra mappings", &contra)?;

        Ok(Resolution {
            rule: rule.clone(),
            primary,
            contra,
            template: None,
        })
    }

    fn primary_shares(&self, rule: &AccountingRule, attribute: Option<&AttributeCode>) -> Vec<AccountShare> {
        let direction = rule.primary_direction();
        let narrowed: Vec<_> = match attribute {
            Some(_) => self.registry.determinations_for(&rule.id, attribute).collect(),
            None => Vec::new(),
        };
        let rows = if narrowed.is_empty() {
            self.registry.determinations_for(&rule.id, None).collect()
        } else {
            narrowed
        };

        if !rows.is_empty() {
            return rows
                .into_iter()
                .map(|d| AccountShare {
                    account: d.account.clone(),
                    direction,
                    percentage: d.allocation_percentage,
                    formula: d.allocation_formula.clone(),
                    side: d.branch_side.unwrap_or(BranchSide::Source),
                })
                .collect();
        }

        posting_fallback(rule, direction, BranchSide::Source)
    }

    fn contra_shares(&self, rule: &AccountingRule, attribute: Option<&AttributeCode>) -> Vec<AccountShare> {
        let direction = rule.primary_direction().opposite();
        let default_side = contra_side(rule);
        let narrowed: Vec<_> = match attribute {
            Some(_) => self.registry.contra_mappings_for(&rule.id, attribute).collect(),
            None => Vec::new(),
        };
        let rows = if narrowed.is_empty() {
            self.registry.contra_mappings_for(&rule.id, None).collect()
        } else {
            narrowed
        };

        if !rows.is_empty() {
            return rows
                .into_iter()
                .map(|c| AccountShare {
                    account: c.account.clone(),
                    direction,
                    percentage: c.allocation_percentage,
                    formula: None,
                    side: c.branch_side.unwrap_or(default_side),
                })
                .collect();
        }

        posting_fallback(rule, direction, default_side)
    }
}

fn contra_side(rule: &AccountingRule) -> BranchSide {
    if rule.inter_branch {
        BranchSide::Destination
    } else {
        BranchSide::Source
    }
}

fn posting_fallback(rule: &AccountingRule, direction: Direction, default_side: BranchSide) -> Vec<AccountShare> {
    rule.postings
        .iter()
        .find(|p| p.direction == direction)
        .map(|p| AccountShare {
            account: p.account.clone(),
            direction,
            percentage: Percentage::FULL,
            formula: None,
            side: p.branch_side.unwrap_or(default_side),
        })
        .into_iter()
        .collect()
}

fn recheck(rule: &AccountingRule, what: &str, shares: &[AccountShare]) -> PostingResult<()> {
    if shares.is_empty() || Percentage::sums_to_full(shares.iter().map(|s| s.percentage)) {
        return Ok(());
    }
    Err(PostingError::AllocationMismatch {
        context: format!("{what} of {}", rule.id),
        actual_bp: Percentage::total(shares.iter().map(|s| s.percentage)),
    })
}

fn split_shares(shares: &[AccountShare], vars: &Variables) -> PostingResult<Vec<LegAmount>> {
    if shares.is_empty() {
        return Ok(Vec::new());
    }
    let percentages: Vec<Percentage> = shares.iter().map(|s| s.percentage).collect();
    let amounts = money::allocate(vars.amount, &percentages)?;

    shares
        .iter()
        .zip(amounts)
        .map(|(share, split)| {
            let amount = match &share.formula {
                Some(formula) => formula.evaluate(vars)?,
                None => split,
            };
            Ok(LegAmount {
                leg_number: 0,
                account: share.account.clone(),
                direction: share.direction,
                amount,
                side: share.side,
            })
        })
        .collect()
}
