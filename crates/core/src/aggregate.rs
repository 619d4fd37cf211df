//! Aggregate mechanics: decide with `handle`, evolve with `apply`.

use crate::error::{DomainError, DomainResult};

pub trait AggregateRoot {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Number of events applied so far; the stored header's concurrency token.
    fn version(&self) -> u64;
}

/// Version a writer expects to replace.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation for a reference that has never been stored.
    pub const NEW: ExpectedVersion = ExpectedVersion::Exact(0);

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        match self {
            ExpectedVersion::Exact(expected) if expected != actual => Err(DomainError::conflict(
                format!("expected version {expected}, found {actual}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Pure state machine over commands and events.
///
/// `handle` never mutates and never performs IO; the caller stores the
/// aggregate and publishes the returned events.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Bumps the version by one.
    fn apply(&mut self, event: &Self::Event);

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    fn execute(&mut self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let events = self.handle(command)?;
        events.iter().for_each(|event| self.apply(event));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_expects_nothing_stored() {
        assert!(ExpectedVersion::NEW.matches(0));
        assert!(!ExpectedVersion::NEW.matches(2));
        assert!(ExpectedVersion::Any.matches(42));
    }

    #[test]
    fn stale_writer_gets_a_conflict() {
        let err = ExpectedVersion::Exact(3).check(4).unwrap_err();
        assert_eq!(err, DomainError::conflict("expected version 3, found 4"));
        assert!(ExpectedVersion::Exact(4).check(4).is_ok());
        assert!(ExpectedVersion::Any.check(7).is_ok());
    }
}
