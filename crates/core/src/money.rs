//! Money value types: booking direction, allocation percentages and the
//! deterministic split of a minor-unit amount across legs.
//!
//! Amounts are `i64` in the currency's smallest unit (e.g. cents).

use core::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Booking direction of a ledger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    /// The offsetting direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::Debit => Direction::Credit,
            Direction::Credit => Direction::Debit,
        }
    }

    /// Signed view of an amount: debits positive, credits negative.
    pub fn signed(self, amount: i64) -> i128 {
        match self {
            Direction::Debit => amount as i128,
            Direction::Credit => -(amount as i128),
        }
    }
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Direction::Debit => f.write_str("debit"),
            Direction::Credit => f.write_str("credit"),
        }
    }
}

/// Allocation percentage with two decimals of precision.
///
/// Stored as basis points so sums are exact: `Percentage::FULL` is 100 %.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Percentage(u32);

impl Percentage {
    pub const ZERO: Percentage = Percentage(0);
    pub const FULL: Percentage = Percentage(10_000);

    pub fn from_basis_points(bp: u32) -> DomainResult<Self> {
        if bp > Self::FULL.0 {
            return Err(DomainError::validation(format!(
                "percentage above 100: {bp} basis points"
            )));
        }
        Ok(Self(bp))
    }

    /// Whole percent, e.g. `Percentage::from_whole(70)` is 70 %.
    pub fn from_whole(percent: u32) -> DomainResult<Self> {
        percent
            .checked_mul(100)
            .ok_or_else(|| DomainError::validation("percentage overflow"))
            .and_then(Self::from_basis_points)
    }

    pub fn basis_points(self) -> u32 {
        self.0
    }

    pub fn as_decimal(self) -> Decimal {
        Decimal::new(self.0 as i64, 2)
    }

    /// Sum of a set of percentages in basis points (may exceed 100 %).
    pub fn total(items: impl IntoIterator<Item = Percentage>) -> u64 {
        items.into_iter().map(|p| p.0 as u64).sum()
    }

    /// Whether a set of percentages adds up to exactly 100 %.
    pub fn sums_to_full(items: impl IntoIterator<Item = Percentage>) -> bool {
        Self::total(items) == Self::FULL.0 as u64
    }
}

impl core::fmt::Display for Percentage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}%", self.as_decimal().normalize())
    }
}

impl TryFrom<Decimal> for Percentage {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        if value.is_sign_negative() {
            return Err(DomainError::validation(format!("negative percentage: {value}")));
        }
        let bp = value * Decimal::ONE_HUNDRED;
        if bp.fract() != Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "percentage has more than two decimals: {value}"
            )));
        }
        let bp = bp
            .to_u32()
            .ok_or_else(|| DomainError::validation(format!("percentage out of range: {value}")))?;
        Self::from_basis_points(bp)
    }
}

impl From<Percentage> for Decimal {
    fn from(value: Percentage) -> Self {
        value.as_decimal()
    }
}

impl FromStr for Percentage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let d = Decimal::from_str(s.trim().trim_end_matches('%'))
            .map_err(|e| DomainError::validation(format!("invalid percentage {s:?}: {e}")))?;
        Self::try_from(d)
    }
}

/// Split `amount` across `shares`.
///
/// Every leg is rounded down; the residual minor units go to the first
/// (primary) leg so the legs always sum back to `amount`. `shares` must sum to
/// exactly 100 %.
pub fn allocate(amount: i64, shares: &[Percentage]) -> DomainResult<Vec<i64>> {
    if shares.is_empty() {
        return Err(DomainError::validation("allocation needs at least one share"));
    }
    if !Percentage::sums_to_full(shares.iter().copied()) {
        return Err(DomainError::invariant(format!(
            "allocation shares sum to {} basis points, expected 10000",
            Percentage::total(shares.iter().copied())
        )));
    }
    if amount < 0 {
        return Err(DomainError::validation("cannot allocate a negative amount"));
    }

    let full = Percentage::FULL.0 as i128;
    let mut legs: Vec<i64> = shares
        .iter()
        .map(|share| ((amount as i128 * share.0 as i128) / full) as i64)
        .collect();

    let allocated: i64 = legs.iter().sum();
    legs[0] += amount - allocated;

    Ok(legs)
}
