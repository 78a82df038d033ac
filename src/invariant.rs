//! Reporting for lifecycle invariant violations.
//!
//! A violation means the reference-counting or close protocol itself is
//! broken. Continuing would run on undefined lifecycle state, so every
//! violation is logged at `error` level and counted; with the `hardened`
//! feature the process aborts instead of continuing.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::error;

static REPORTED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A store reached shutdown while iterator fronts were still registered.
    DependentsAtShutdown,
    /// A handle entered its destructor more than once.
    DoubleDestroy,
    /// A cursor handoff transition was attempted from a state that does not own it.
    HandoffOwnership,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::DependentsAtShutdown => "dependents_at_shutdown",
            ViolationKind::DoubleDestroy => "double_destroy",
            ViolationKind::HandoffOwnership => "handoff_ownership",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lifecycle invariant violated ({kind}): {detail}")]
pub struct InvariantViolation {
    pub kind: ViolationKind,
    pub detail: String,
}

impl InvariantViolation {
    pub fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Logs and counts a violation. Aborts the process under the `hardened` feature.
pub fn report(violation: &InvariantViolation) {
    REPORTED.fetch_add(1, Ordering::SeqCst);
    error!(
        kind = %violation.kind,
        detail = %violation.detail,
        "lifecycle invariant violated"
    );
    #[cfg(feature = "hardened")]
    std::process::abort();
}

/// Number of violations reported by this process so far.
pub fn reported_count() -> u64 {
    REPORTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::{InvariantViolation, ViolationKind, report, reported_count};

    #[test]
    #[cfg(not(feature = "hardened"))]
    fn report_increments_process_counter() {
        let before = reported_count();
        report(&InvariantViolation::new(
            ViolationKind::DoubleDestroy,
            "test double destroy",
        ));
        assert!(reported_count() > before);
    }

    #[test]
    fn violation_display_names_kind() {
        let v = InvariantViolation::new(ViolationKind::DependentsAtShutdown, "2 iterators left");
        assert_eq!(
            v.to_string(),
            "lifecycle invariant violated (dependents_at_shutdown): 2 iterators left"
        );
    }
}
