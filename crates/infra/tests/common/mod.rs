#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use branchledger_accounting::{AccountKey, AccountKind, LedgerAccount, PostingRequest, RuleRegistry, Variables};
use branchledger_infra::{EngineConfig, InMemoryPostingEngine, RetryPolicy};

pub const REGISTRY_JSON: &str = r#"{
  "events": [
    { "code": "DEPOSIT@SAV001", "account_type": "SAVINGS", "attributes": [{ "code": "CASH" }] },
    { "code": "TRANSFER@SAV001", "account_type": "SAVINGS" },
    { "code": "DISBURSE@LN001", "account_type": "LOAN" }
  ],
  "rules": [
    {
      "id": "R-DEP",
      "event": "DEPOSIT@SAV001",
      "entry_type": "cash",
      "postings": [
        { "account": "1000", "direction": "debit" },
        { "account": "2100", "direction": "credit" }
      ]
    },
    {
      "id": "R-XFER",
      "event": "TRANSFER@SAV001",
      "inter_branch": true,
      "double_validation": true,
      "postings": [
        { "account": "2100", "direction": "debit" },
        { "account": "2100", "direction": "credit" }
      ]
    },
    { "id": "R-LOAN", "event": "DISBURSE@LN001", "template": "T-LOAN" }
  ],
  "determinations": [
    { "rule": "R-DEP", "account": "1000", "allocation_percentage": "70" },
    { "rule": "R-DEP", "account": "1010", "allocation_percentage": "30" }
  ],
  "templates": [
    {
      "id": "T-LOAN",
      "name": "loan disbursement",
      "number_of_legs": 3,
      "legs": [
        { "leg_number": 1, "account": "1300", "direction": "debit", "allocation_percentage": "100", "amount_formula": "principal" },
        { "leg_number": 2, "account": "4100", "direction": "credit", "allocation_percentage": "100", "amount_formula": "fee" },
        { "leg_number": 3, "account": "2400", "direction": "credit", "allocation_percentage": "100", "amount_formula": "fee * 0.15" }
      ],
      "contra": [{ "account": "1000", "allocation_percentage": "100" }]
    }
  ]
}"#;

pub const CHART: &[(&str, &str, AccountKind)] = &[
    ("1000", "Cash", AccountKind::Asset),
    ("1010", "Vault", AccountKind::Asset),
    ("1300", "Loans receivable", AccountKind::Asset),
    ("2100", "Savings deposits", AccountKind::Liability),
    ("2400", "Tax payable", AccountKind::Liability),
    ("4100", "Fee income", AccountKind::Revenue),
];

pub fn code<T: core::str::FromStr>(s: &str) -> T
where
    T::Err: core::fmt::Debug,
{
    s.parse().unwrap()
}

pub fn key(branch: &str, account: &str) -> AccountKey {
    AccountKey::new(code(branch), code(account))
}

pub fn registry() -> RuleRegistry {
    RuleRegistry::from_json(REGISTRY_JSON).unwrap()
}

pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_dispatch_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
        .with_ack_timeout(Duration::from_secs(60))
}

/// Engine over in-memory adapters with the chart opened on BR1 and BR2.
pub async fn engine() -> Arc<InMemoryPostingEngine> {
    engine_with(test_config()).await
}

pub async fn engine_with(config: EngineConfig) -> Arc<InMemoryPostingEngine> {
    branchledger_observability::init_for_tests();
    let engine = Arc::new(InMemoryPostingEngine::in_memory(registry(), config));
    open_chart(&engine, "BR1").await;
    open_chart(&engine, "BR2").await;
    engine
}

pub async fn open_chart(engine: &InMemoryPostingEngine, branch: &str) {
    for (account, name, kind) in CHART {
        engine
            .open_account(LedgerAccount::open(key(branch, account), *name, *kind))
            .await
            .unwrap();
    }
}

pub async fn balance(engine: &InMemoryPostingEngine, branch: &str, account: &str) -> i64 {
    engine
        .account(&key(branch, account))
        .await
        .unwrap()
        .map(|a| a.balance)
        .unwrap_or_default()
}

pub fn deposit(reference: &str, amount: i64) -> PostingRequest {
    PostingRequest::new(code("DEPOSIT@SAV001"), amount, code("BR1"), code(reference))
}

pub fn transfer(reference: &str, amount: i64) -> PostingRequest {
    PostingRequest::new(code("TRANSFER@SAV001"), amount, code("BR1"), code(reference))
        .with_destination(code("BR2"))
}

pub fn disbursement(reference: &str, principal: i64, fee: i64) -> PostingRequest {
    PostingRequest::new(code("DISBURSE@LN001"), principal, code("BR1"), code(reference)).with_variables(
        Variables {
            principal: Some(principal),
            fee: Some(fee),
            ..Variables::with_amount(principal)
        },
    )
}
