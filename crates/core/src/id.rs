//! Strongly-typed identifiers used across the ledger.
//!
//! Configuration keys and references are short business codes (`BR001`,
//! `DEPOSIT@SAV001`, `TXN-2024-0001`); permanent ledger rows get UUIDv7 ids.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

const MAX_CODE_LEN: usize = 64;
const REVERSAL_PREFIX: &str = "REV:";

/// Identifier of a branch (the ledger partition boundary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchId(String);

/// Chart-of-account identifier (e.g. `1000` cash, `2100` savings deposits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountCode(String);

/// Business event code (e.g. `DEPOSIT@SAV001`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventCode(String);

/// Value component of an event (e.g. `PRINCIPAL`, `FEE`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributeCode(String);

/// Accounting rule identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleId(String);

/// Accounting template identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TemplateId(String);

/// Caller-supplied transaction reference: the unit of atomicity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionRef(String);

/// Identifier of a permanent posted ledger entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostedEntryId(Uuid);

fn validate_code(name: &'static str, raw: &str) -> Result<(), DomainError> {
    if raw.is_empty() {
        return Err(DomainError::invalid_code(name, "must not be empty"));
    }
    if raw.len() > MAX_CODE_LEN {
        return Err(DomainError::invalid_code(
            name,
            format!("longer than {MAX_CODE_LEN} characters"),
        ));
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(DomainError::invalid_code(
            name,
            format!("must not contain whitespace ({raw:?})"),
        ));
    }
    Ok(())
}

macro_rules! impl_code_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Build a code, rejecting empty, over-long or whitespace-bearing input.
            pub fn new(code: impl Into<String>) -> Result<Self, DomainError> {
                let code = code.into();
                validate_code($name, &code)?;
                Ok(Self(code))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_code_newtype!(BranchId, "BranchId");
impl_code_newtype!(AccountCode, "AccountCode");
impl_code_newtype!(EventCode, "EventCode");
impl_code_newtype!(AttributeCode, "AttributeCode");
impl_code_newtype!(RuleId, "RuleId");
impl_code_newtype!(TemplateId, "TemplateId");
impl_code_newtype!(TransactionRef, "TransactionRef");

impl TransactionRef {
    /// Longest reference a caller may submit; the rest is kept for `REV:`.
    pub const MAX_SUBMITTED_LEN: usize = MAX_CODE_LEN - REVERSAL_PREFIX.len();

    /// Reference of the batch that reverses `original`.
    pub fn reversal_of(original: &TransactionRef) -> Result<TransactionRef, DomainError> {
        TransactionRef::new(format!("{REVERSAL_PREFIX}{}", original.0))
    }

    /// Whether this reference lives in the engine's reversal namespace.
    pub fn is_reversal(&self) -> bool {
        self.0.starts_with(REVERSAL_PREFIX)
    }

    /// Reject references a caller may not submit: the reserved `REV:`
    /// namespace and anything too long to be reversed later.
    pub fn ensure_submittable(&self) -> Result<(), DomainError> {
        if self.is_reversal() {
            return Err(DomainError::invalid_code(
                "TransactionRef",
                format!("prefix {REVERSAL_PREFIX:?} is reserved for reversals ({})", self.0),
            ));
        }
        if self.0.len() > Self::MAX_SUBMITTED_LEN {
            return Err(DomainError::invalid_code(
                "TransactionRef",
                format!("submitted references are limited to {} characters", Self::MAX_SUBMITTED_LEN),
            ));
        }
        Ok(())
    }
}

impl PostedEntryId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PostedEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PostedEntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for PostedEntryId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for PostedEntryId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_code("PostedEntryId", e.to_string()))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_reject_blank_and_whitespace() {
        assert!(BranchId::new("").is_err());
        assert!(BranchId::new("BR 01").is_err());
        assert!(BranchId::new("x".repeat(65)).is_err());
        assert_eq!(BranchId::new("BR01").unwrap().as_str(), "BR01");
    }

    #[test]
    fn codes_deserialize_through_validation() {
        let ok: EventCode = serde_json::from_str("\"DEPOSIT@SAV001\"").unwrap();
        assert_eq!(ok.to_string(), "DEPOSIT@SAV001");

        let bad = serde_json::from_str::<EventCode>("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn reversal_reference_points_at_original() {
        let original = TransactionRef::new("TXN-1").unwrap();
        let reversal = TransactionRef::reversal_of(&original).unwrap();
        assert_eq!(reversal.as_str(), "REV:TXN-1");
        assert!(reversal.is_reversal());
        assert!(!original.is_reversal());
    }

    #[test]
    fn longest_submittable_reference_reverses_and_round_trips() {
        let original = TransactionRef::new("T".repeat(TransactionRef::MAX_SUBMITTED_LEN)).unwrap();
        original.ensure_submittable().unwrap();

        let reversal = TransactionRef::reversal_of(&original).unwrap();
        let json = serde_json::to_string(&reversal).unwrap();
        let back: TransactionRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reversal);

        let too_long = TransactionRef::new("T".repeat(TransactionRef::MAX_SUBMITTED_LEN + 1)).unwrap();
        assert!(too_long.ensure_submittable().is_err());
        assert!(TransactionRef::reversal_of(&too_long).is_err());
    }

    #[test]
    fn reversal_namespace_is_not_submittable() {
        let spoofed = TransactionRef::new("REV:TXN-1").unwrap();
        assert!(spoofed.ensure_submittable().is_err());
        assert!(TransactionRef::new("TXN-1").unwrap().ensure_submittable().is_ok());
    }
}
