//! Best-effort results for fire-and-forget mutations.
//!
//! Cascade deletes and association inserts must not stop at the first
//! failing statement. Each statement yields an [`Outcome`]; the caller
//! aggregates them into a [`BestEffort`] report and logs it once.

use crate::Error;
use std::fmt;

/// Result of one best-effort statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The statement ran. Zero rows is still success.
    Applied { rows: u64 },
    /// Nothing to do, for an expected reason.
    Skipped { reason: String },
    /// The statement failed.
    Failed { reason: String },
}

impl Outcome {
    pub fn applied(rows: u64) -> Self {
        Self::Applied { rows }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(err: &Error) -> Self {
        Self::Failed {
            reason: err.to_string(),
        }
    }

    /// Collapse a statement result into an outcome.
    pub fn from_rows(result: crate::Result<u64>) -> Self {
        match result {
            Ok(rows) => Self::applied(rows),
            Err(e) => Self::failed(&e),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Short label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One statement's outcome, tagged with what it targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    /// Statement name, e.g. `remove_from_labels`.
    pub operation: &'static str,
    /// Entity the statement targeted (usually a sensor id).
    pub target: String,
    pub outcome: Outcome,
}

/// Aggregated outcomes of a best-effort operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BestEffort {
    results: Vec<OpResult>,
}

impl BestEffort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: &'static str, target: impl Into<String>, outcome: Outcome) {
        self.results.push(OpResult {
            operation,
            target: target.into(),
            outcome,
        });
    }

    /// Append every result of `other`.
    pub fn merge(&mut self, other: BestEffort) {
        self.results.extend(other.results);
    }

    pub fn results(&self) -> &[OpResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Applied { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::is_failed)
    }

    /// Total rows touched by applied statements.
    pub fn rows_affected(&self) -> u64 {
        self.results
            .iter()
            .map(|r| match r.outcome {
                Outcome::Applied { rows } => rows,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &OpResult> {
        self.results.iter().filter(|r| r.outcome.is_failed())
    }

    /// Whether every statement applied or was skipped.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }

    /// Log the summary, plus one warning per failed statement.
    pub fn log(&self, context: &str) {
        for failure in self.failures() {
            if let Outcome::Failed { reason } = &failure.outcome {
                tracing::warn!(
                    operation = failure.operation,
                    target = %failure.target,
                    %reason,
                    "{context}: statement failed"
                );
            }
        }
        if self.is_clean() {
            tracing::debug!("{context}: {self}");
        } else {
            tracing::warn!("{context}: {self}");
        }
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

impl fmt::Display for BestEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied ({} rows), {} skipped, {} failed",
            self.applied(),
            self.rows_affected(),
            self.skipped(),
            self.failed()
        )
    }
}
