//! Rule registry: the immutable, versioned configuration snapshot.
//!
//! Configuration rows (operation events, accounting rules, determinations,
//! contra mappings, templates) are only ever changed through
//! [`ConfigCommand`]s. Applying a command produces a *new* validated
//! [`RuleRegistry`] with the next version; the previous snapshot is never
//! mutated, so in-flight requests keep a consistent view.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use branchledger_core::{
    AccountCode, AttributeCode, BranchId, Direction, EventCode, Percentage, RuleId, TemplateId,
};

use crate::chain::ChainGraph;
use crate::error::{PostingError, PostingResult};
use crate::formula::Formula;

/// Which branch of a transaction a line lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchSide {
    Source,
    Destination,
}

/// Accounting nature of the entries a rule produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Cash,
    #[default]
    Transfer,
    Clearing,
    Accrual,
}

/// A distinguishable value component of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEventAttribute {
    pub code: AttributeCode,
    #[serde(default)]
    pub description: String,
}

/// A named business event (e.g. `DEPOSIT@SAV001`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEvent {
    pub code: EventCode,
    /// Product / account type the event belongs to (e.g. `SAVINGS`).
    pub account_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: Vec<OperationEventAttribute>,
    #[serde(default = "active_default")]
    pub active: bool,
}

impl OperationEvent {
    pub fn has_attribute(&self, code: &AttributeCode) -> bool {
        self.attributes.iter().any(|a| &a.code == code)
    }
}

/// One (chart account, booking direction) pair of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePosting {
    pub account: AccountCode,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_side: Option<BranchSide>,
}

/// Link from a chain-entry rule to the event it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub next_event: EventCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attribute: Option<AttributeCode>,
    /// 1-based primary leg whose amount becomes the next event's input.
    #[serde(default = "first_leg")]
    pub source_leg: usize,
}

/// Configuration row keyed by event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingRule {
    pub id: RuleId,
    pub event: EventCode,
    /// Default accounts. The first pair's direction is the primary direction.
    #[serde(default)]
    pub postings: Vec<RulePosting>,
    #[serde(default)]
    pub entry_type: EntryType,
    #[serde(default)]
    pub double_validation: bool,
    #[serde(default)]
    pub inter_branch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateId>,
    /// Empty means every branch.
    #[serde(default)]
    pub eligible_branches: Vec<BranchId>,
    #[serde(default = "active_default")]
    pub active: bool,
}

impl AccountingRule {
    pub fn is_chain_entry(&self) -> bool {
        self.chain.is_some()
    }

    pub fn is_eligible(&self, branch: &BranchId) -> bool {
        self.eligible_branches.is_empty() || self.eligible_branches.contains(branch)
    }

    /// Direction of the primary side; templates default to debit.
    pub fn primary_direction(&self) -> Direction {
        self.postings
            .first()
            .map(|p| p.direction)
            .unwrap_or(Direction::Debit)
    }
}

/// Maps a rule (optionally narrowed to one attribute) to a target account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetermination {
    pub rule: RuleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<AttributeCode>,
    pub account: AccountCode,
    pub allocation_percentage: Percentage,
    /// Overrides the percentage share with an explicit amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_formula: Option<Formula>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_side: Option<BranchSide>,
}

/// Offsetting-side counterpart of [`AccountDetermination`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContraAccountMapping {
    pub rule: RuleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<AttributeCode>,
    pub account: AccountCode,
    pub allocation_percentage: Percentage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_side: Option<BranchSide>,
}

/// One account row of a template leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateAccountMapping {
    pub leg_number: u32,
    pub account: AccountCode,
    pub direction: Direction,
    pub allocation_percentage: Percentage,
    /// Amount of the leg; rows without a formula share the input amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_formula: Option<Formula>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_side: Option<BranchSide>,
}

/// Contra row of a template: splits the net of the template's legs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateContraMapping {
    pub account: AccountCode,
    pub allocation_percentage: Percentage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_side: Option<BranchSide>,
}

/// Reusable multi-leg posting structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingTemplate {
    pub id: TemplateId,
    pub name: String,
    pub number_of_legs: u32,
    pub legs: Vec<TemplateAccountMapping>,
    #[serde(default)]
    pub contra: Vec<TemplateContraMapping>,
    #[serde(default = "active_default")]
    pub active: bool,
}

impl AccountingTemplate {
    /// Rows grouped by allocation group, in leg order.
    ///
    /// Rows carrying a formula form one group per leg number; rows without a
    /// formula form a single group sharing the input amount.
    pub fn allocation_groups(&self) -> Vec<(Option<u32>, Vec<&TemplateAccountMapping>)> {
        let mut shared: Vec<&TemplateAccountMapping> = Vec::new();
        let mut per_leg: BTreeMap<u32, Vec<&TemplateAccountMapping>> = BTreeMap::new();

        let mut rows: Vec<&TemplateAccountMapping> = self.legs.iter().collect();
        rows.sort_by_key(|r| r.leg_number);

        for row in rows {
            if row.amount_formula.is_some() {
                per_leg.entry(row.leg_number).or_default().push(row);
            } else {
                shared.push(row);
            }
        }

        let mut groups: Vec<(Option<u32>, Vec<&TemplateAccountMapping>)> = Vec::new();
        if !shared.is_empty() {
            groups.push((None, shared));
        }
        groups.extend(per_leg.into_iter().map(|(leg, rows)| (Some(leg), rows)));
        groups.sort_by_key(|(_, rows)| rows[0].leg_number);
        groups
    }
}

/// Serializable form of a complete registry (e.g. loaded from JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub events: Vec<OperationEvent>,
    #[serde(default)]
    pub rules: Vec<AccountingRule>,
    #[serde(default)]
    pub determinations: Vec<AccountDetermination>,
    #[serde(default)]
    pub contra_mappings: Vec<ContraAccountMapping>,
    #[serde(default)]
    pub templates: Vec<AccountingTemplate>,
}

/// Administrative configuration commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum ConfigCommand {
    UpsertEvent(OperationEvent),
    UpsertRule(AccountingRule),
    /// Replace every determination of `(rule, attribute)`.
    ReplaceDeterminations {
        rule: RuleId,
        attribute: Option<AttributeCode>,
        rows: Vec<AccountDetermination>,
    },
    /// Replace every contra mapping of `(rule, attribute)`.
    ReplaceContraMappings {
        rule: RuleId,
        attribute: Option<AttributeCode>,
        rows: Vec<ContraAccountMapping>,
    },
    UpsertTemplate(AccountingTemplate),
    DeactivateEvent(EventCode),
    DeactivateRule(RuleId),
    DeactivateTemplate(TemplateId),
}

/// Immutable, validated configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleRegistry {
    version: u64,
    events: BTreeMap<EventCode, OperationEvent>,
    rules: BTreeMap<RuleId, AccountingRule>,
    determinations: Vec<AccountDetermination>,
    contra_mappings: Vec<ContraAccountMapping>,
    templates: BTreeMap<TemplateId, AccountingTemplate>,
}

impl RuleRegistry {
    /// Empty registry (version 0).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build and validate a registry from a document (version 1).
    pub fn from_document(doc: RegistryDocument) -> PostingResult<Self> {
        let mut registry = Self {
            version: 1,
            ..Self::default()
        };
        for event in doc.events {
            registry.events.insert(event.code.clone(), event);
        }
        for rule in doc.rules {
            if registry.rules.insert(rule.id.clone(), rule).is_some() {
                return Err(PostingError::configuration("duplicate rule id in document"));
            }
        }
        for template in doc.templates {
            registry.templates.insert(template.id.clone(), template);
        }
        registry.determinations = doc.determinations;
        registry.contra_mappings = doc.contra_mappings;

        registry.validate()?;
        Ok(registry)
    }

    /// Parse a JSON [`RegistryDocument`] and validate it.
    pub fn from_json(json: &str) -> PostingResult<Self> {
        let doc: RegistryDocument = serde_json::from_str(json)
            .map_err(|e| PostingError::configuration(format!("invalid registry document: {e}")))?;
        Self::from_document(doc)
    }

    /// Validated snapshot built from `doc` that supersedes this one.
    pub fn replace_with(&self, doc: RegistryDocument) -> PostingResult<Self> {
        let mut next = Self::from_document(doc)?;
        next.version = self.version + 1;
        Ok(next)
    }

    /// Snapshot back into its document form.
    pub fn to_document(&self) -> RegistryDocument {
        RegistryDocument {
            events: self.events.values().cloned().collect(),
            rules: self.rules.values().cloned().collect(),
            determinations: self.determinations.clone(),
            contra_mappings: self.contra_mappings.clone(),
            templates: self.templates.values().cloned().collect(),
        }
    }

    /// Apply a configuration command, returning the next validated snapshot.
    ///
    /// `self` is left untouched whether or not the command is accepted.
    pub fn apply(&self, command: ConfigCommand) -> PostingResult<Self> {
        let mut next = self.clone();
        match command {
            ConfigCommand::UpsertEvent(event) => {
                next.events.insert(event.code.clone(), event);
            }
            ConfigCommand::UpsertRule(rule) => {
                next.rules.insert(rule.id.clone(), rule);
            }
            ConfigCommand::ReplaceDeterminations {
                rule,
                attribute,
                rows,
            } => {
                if rows.iter().any(|r| r.rule != rule || r.attribute != attribute) {
                    return Err(PostingError::configuration(format!(
                        "determination rows must all target rule {rule} / {attribute:?}"
                    )));
                }
                next.determinations
                    .retain(|d| !(d.rule == rule && d.attribute == attribute));
                next.determinations.extend(rows);
            }
            ConfigCommand::ReplaceContraMappings {
                rule,
                attribute,
                rows,
            } => {
                if rows.iter().any(|r| r.rule != rule || r.attribute != attribute) {
                    return Err(PostingError::configuration(format!(
                        "contra rows must all target rule {rule} / {attribute:?}"
                    )));
                }
                next.contra_mappings
                    .retain(|c| !(c.rule == rule && c.attribute == attribute));
                next.contra_mappings.extend(rows);
            }
            ConfigCommand::UpsertTemplate(template) => {
                next.templates.insert(template.id.clone(), template);
            }
            ConfigCommand::DeactivateEvent(code) => {
                let event = next
                    .events
                    .get_mut(&code)
                    .ok_or_else(|| PostingError::configuration(format!("unknown event {code}")))?;
                event.active = false;
            }
            ConfigCommand::DeactivateRule(id) => {
                let rule = next
                    .rules
                    .get_mut(&id)
                    .ok_or_else(|| PostingError::configuration(format!("unknown rule {id}")))?;
                rule.active = false;
            }
            ConfigCommand::DeactivateTemplate(id) => {
                let template = next.templates.get_mut(&id).ok_or_else(|| {
                    PostingError::configuration(format!("unknown template {id}"))
                })?;
                template.active = false;
            }
        }

        next.validate()?;
        next.version = self.version + 1;
        Ok(next)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn event(&self, code: &EventCode) -> Option<&OperationEvent> {
        self.events.get(code)
    }

    pub fn rule(&self, id: &RuleId) -> Option<&AccountingRule> {
        self.rules.get(id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &AccountingRule> {
        self.rules.values()
    }

    pub fn template(&self, id: &TemplateId) -> Option<&AccountingTemplate> {
        self.templates.get(id)
    }

    /// Determinations of `(rule, attribute)`, exactly as configured.
    pub fn determinations_for<'a>(
        &'a self,
        rule: &'a RuleId,
        attribute: Option<&'a AttributeCode>,
    ) -> impl Iterator<Item = &'a AccountDetermination> + 'a {
        self.determinations
            .iter()
            .filter(move |d| &d.rule == rule && d.attribute.as_ref() == attribute)
    }

    /// Contra mappings of `(rule, attribute)`, exactly as configured.
    pub fn contra_mappings_for<'a>(
        &'a self,
        rule: &'a RuleId,
        attribute: Option<&'a AttributeCode>,
    ) -> impl Iterator<Item = &'a ContraAccountMapping> + 'a {
        self.contra_mappings
            .iter()
            .filter(move |c| &c.rule == rule && c.attribute.as_ref() == attribute)
    }

    /// Active rules of an event that apply to `branch`, most specific first.
    pub fn candidate_rules<'a>(
        &'a self,
        event: &EventCode,
        branch: &BranchId,
    ) -> Vec<&'a AccountingRule> {
        let event_active = self.events.get(event).is_some_and(|e| e.active);
        if !event_active {
            return Vec::new();
        }

        let mut rules: Vec<&AccountingRule> = self
            .rules
            .values()
            .filter(|r| r.active && &r.event == event && r.is_eligible(branch))
            .collect();
        rules.sort_by_key(|r| r.eligible_branches.is_empty());
        rules
    }

    /// Check every configuration invariant.
    pub fn validate(&self) -> PostingResult<()> {
        for rule in self.rules.values() {
            self.validate_rule(rule)?;
        }
        self.validate_eligibility_overlap()?;
        self.validate_allocations()?;
        for template in self.templates.values() {
            validate_template(template)?;
        }

        let graph = ChainGraph::from_rules(self.rules.values());
        if let Some(path) = graph.find_cycle() {
            return Err(PostingError::ChainCycle { path });
        }
        Ok(())
    }

    fn validate_rule(&self, rule: &AccountingRule) -> PostingResult<()> {
        let event = self.events.get(&rule.event).ok_or_else(|| {
            PostingError::configuration(format!(
                "rule {} references unknown event {}",
                rule.id, rule.event
            ))
        })?;

        if !rule.active {
            return Ok(());
        }

        match &rule.template {
            Some(template_id) => {
                let template = self.templates.get(template_id).ok_or_else(|| {
                    PostingError::configuration(format!(
                        "rule {} references unknown template {template_id}",
                        rule.id
                    ))
                })?;
                if !template.active {
                    return Err(PostingError::configuration(format!(
                        "rule {} references inactive template {template_id}",
                        rule.id
                    )));
                }
            }
            None => {
                let has_primary = !rule.postings.is_empty()
                    || self.determinations.iter().any(|d| d.rule == rule.id);
                if !has_primary {
                    return Err(PostingError::configuration(format!(
                        "rule {} has neither postings nor determinations",
                        rule.id
                    )));
                }
            }
        }

        if rule.inter_branch && !self.has_contra_side(rule) {
            return Err(PostingError::configuration(format!(
                "inter-branch rule {} has no contra accounts for the destination branch",
                rule.id
            )));
        }

        if let Some(link) = &rule.chain {
            if link.source_leg == 0 {
                return Err(PostingError::configuration(format!(
                    "rule {} chains from leg 0; legs are 1-based",
                    rule.id
                )));
            }
            let target_has_rule = self
                .rules
                .values()
                .any(|r| r.active && r.event == link.next_event);
            if !target_has_rule {
                return Err(PostingError::configuration(format!(
                    "rule {} chains to {} which has no active rule",
                    rule.id, link.next_event
                )));
            }
        }

        for d in self.determinations.iter().filter(|d| d.rule == rule.id) {
            if let Some(attr) = &d.attribute {
                if !event.has_attribute(attr) {
                    return Err(PostingError::configuration(format!(
                        "determination for rule {} uses attribute {attr} not defined on {}",
                        rule.id, event.code
                    )));
                }
            }
        }
        Ok(())
    }

    fn has_contra_side(&self, rule: &AccountingRule) -> bool {
        let primary = rule.primary_direction();
        let postings = rule.postings.iter().any(|p| p.direction != primary);
        let mapped = self.contra_mappings.iter().any(|c| c.rule == rule.id);
        let templated = rule
            .template
            .as_ref()
            .and_then(|t| self.templates.get(t))
            .is_some_and(|t| !t.contra.is_empty());
        postings || mapped || templated
    }

    fn validate_eligibility_overlap(&self) -> PostingResult<()> {
        // (event, Some(branch)) for explicit lists, (event, None) for "all branches".
        let mut seen: BTreeSet<(EventCode, Option<BranchId>)> = BTreeSet::new();
        for rule in self.rules.values().filter(|r| r.active) {
            let keys: Vec<Option<BranchId>> = if rule.eligible_branches.is_empty() {
                vec![None]
            } else {
                rule.eligible_branches.iter().cloned().map(Some).collect()
            };
            for key in keys {
                if !seen.insert((rule.event.clone(), key.clone())) {
                    return Err(PostingError::configuration(format!(
                        "more than one active rule for event {} on {}",
                        rule.event,
                        key.map(|b| b.to_string())
                            .unwrap_or_else(|| "all branches".to_string())
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_allocations(&self) -> PostingResult<()> {
        for d in &self.determinations {
            if !self.rules.contains_key(&d.rule) {
                return Err(PostingError::configuration(format!(
                    "determination references unknown rule {}",
                    d.rule
                )));
            }
        }
        for c in &self.contra_mappings {
            if !self.rules.contains_key(&c.rule) {
                return Err(PostingError::configuration(format!(
                    "contra mapping references unknown rule {}",
                    c.rule
                )));
            }
        }

        let mut determination_groups: BTreeMap<(&RuleId, Option<&AttributeCode>), Vec<Percentage>> =
            BTreeMap::new();
        for d in &self.determinations {
            determination_groups
                .entry((&d.rule, d.attribute.as_ref()))
                .or_default()
                .push(d.allocation_percentage);
        }
        for ((rule, attr), shares) in determination_groups {
            check_full(format!("determinations of {rule}{}", attr_suffix(attr)), &shares)?;
        }

        let mut contra_groups: BTreeMap<(&RuleId, Option<&AttributeCode>), Vec<Percentage>> =
            BTreeMap::new();
        for c in &self.contra_mappings {
            contra_groups
                .entry((&c.rule, c.attribute.as_ref()))
                .or_default()
                .push(c.allocation_percentage);
        }
        for ((rule, attr), shares) in contra_groups {
            check_full(format!("contra mappings of {rule}{}", attr_suffix(attr)), &shares)?;
        }
        Ok(())
    }
}

/// Template invariants: leg numbering, allocation group sums, contra sum.
pub fn validate_template(template: &AccountingTemplate) -> PostingResult<()> {
    if template.legs.is_empty() {
        return Err(PostingError::configuration(format!(
            "template {} has no legs",
            template.id
        )));
    }

    let legs: BTreeSet<u32> = template.legs.iter().map(|l| l.leg_number).collect();
    let expected: BTreeSet<u32> = (1..=template.number_of_legs).collect();
    if legs != expected {
        return Err(PostingError::configuration(format!(
            "template {} declares {} legs but maps leg numbers {:?}",
            template.id, template.number_of_legs, legs
        )));
    }

    for leg in &legs {
        let rows: Vec<&TemplateAccountMapping> =
            template.legs.iter().filter(|l| l.leg_number == *leg).collect();
        let with_formula = rows.iter().filter(|r| r.amount_formula.is_some()).count();
        if with_formula != 0 && with_formula != rows.len() {
            return Err(PostingError::configuration(format!(
                "template {} leg {leg} mixes formula and shared-amount rows",
                template.id
            )));
        }
        if let Some(first) = rows.iter().find_map(|r| r.amount_formula.as_ref()) {
            if rows.iter().any(|r| r.amount_formula.as_ref() != Some(first)) {
                return Err(PostingError::configuration(format!(
                    "template {} leg {leg} rows disagree on the amount formula",
                    template.id
                )));
            }
        }
    }

    for (leg, rows) in template.allocation_groups() {
        let shares: Vec<Percentage> = rows.iter().map(|r| r.allocation_percentage).collect();
        let context = match leg {
            Some(leg) => format!("template {} leg {leg}", template.id),
            None => format!("template {} shared legs", template.id),
        };
        check_full(context, &shares)?;
    }

    if !template.contra.is_empty() {
        let shares: Vec<Percentage> = template
            .contra
            .iter()
            .map(|c| c.allocation_percentage)
            .collect();
        check_full(format!("template {} contra", template.id), &shares)?;
    }
    Ok(())
}

fn check_full(context: String, shares: &[Percentage]) -> PostingResult<()> {
    if Percentage::sums_to_full(shares.iter().copied()) {
        Ok(())
    } else {
        Err(PostingError::AllocationMismatch {
            context,
            actual_bp: Percentage::total(shares.iter().copied()),
        })
    }
}

fn attr_suffix(attr: Option<&AttributeCode>) -> String {
    attr.map(|a| format!("/{a}")).unwrap_or_default()
}

fn active_default() -> bool {
    true
}

fn first_leg() -> usize {
    1
}
