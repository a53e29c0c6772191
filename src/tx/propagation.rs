//! Propagation modes and transactional scope options.

use crate::error::{DbResult, ErrorKind};
use clap::ValueEnum;

/// How a transactional scope relates to a transaction already bound to the
/// execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum Propagation {
    /// Join the bound transaction, or begin one
    #[default]
    Required,
    /// Suspend the bound transaction and begin a fresh one
    RequiresNew,
    /// Open a savepoint level in the bound transaction, or begin one
    Nested,
    /// Join the bound transaction, or run without one
    Supports,
    /// Suspend the bound transaction and run without one
    NotSupported,
    /// Fail if a transaction is bound
    Never,
    /// Fail unless a transaction is bound
    Mandatory,
}

impl std::fmt::Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Required => "REQUIRED",
            Self::RequiresNew => "REQUIRES_NEW",
            Self::Nested => "NESTED",
            Self::Supports => "SUPPORTS",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Never => "NEVER",
            Self::Mandatory => "MANDATORY",
        };
        f.write_str(name)
    }
}

/// Commit or rollback intent reported when a scope exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOutcome {
    Commit,
    Rollback,
}

impl ScopeOutcome {
    pub fn commits(self) -> bool {
        self == Self::Commit
    }
}

/// Options of one transactional scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub propagation: Propagation,
    /// Error kinds that trigger rollback. Empty means every kind.
    pub rollback_for: Vec<ErrorKind>,
    /// Error kinds that never trigger rollback. Wins over `rollback_for`.
    pub no_rollback_for: Vec<ErrorKind>,
}

impl TxOptions {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    pub fn rollback_for(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.rollback_for.extend(kinds);
        self
    }

    pub fn no_rollback_for(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.no_rollback_for.extend(kinds);
        self
    }

    /// Whether an error of `kind` escaping the scope rolls it back.
    pub fn rolls_back_on(&self, kind: ErrorKind) -> bool {
        if self.no_rollback_for.contains(&kind) {
            return false;
        }
        self.rollback_for.is_empty() || self.rollback_for.contains(&kind)
    }

    /// Exit intent for the result of a unit of work.
    pub fn outcome<T>(&self, result: &DbResult<T>) -> ScopeOutcome {
        match result {
            Err(e) if self.rolls_back_on(e.kind()) => ScopeOutcome::Rollback,
            _ => ScopeOutcome::Commit,
        }
    }
}
