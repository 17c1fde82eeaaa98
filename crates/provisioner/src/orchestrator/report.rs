//! Per-target outcomes and the build summary.

use super::BuildTarget;
use crate::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{error, info};

/// Step of the per-target pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Identity,
    Compile,
    Attach,
    Package,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Identity => "identity",
            FailureStage::Compile => "compile",
            FailureStage::Attach => "attach",
            FailureStage::Package => "package",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    /// Binary built and carrying its credentials.
    Built {
        binary: PathBuf,
        label: String,
        archive: Option<PathBuf>,
    },
    Failed {
        stage: FailureStage,
        message: String,
    },
}

/// Result of one task slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub target: BuildTarget,
    pub status: TargetStatus,
}

impl TargetOutcome {
    pub fn failed(target: BuildTarget, stage: FailureStage, err: &Error) -> Self {
        Self {
            target,
            status: TargetStatus::Failed {
                stage,
                message: err.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TargetStatus::Built { .. })
    }
}

/// Outcome of every dispatched target, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    outcomes: Vec<TargetOutcome>,
}

impl BuildReport {
    pub fn outcomes(&self) -> &[TargetOutcome] {
        &self.outcomes
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(TargetOutcome::is_success)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Logs one line per failure plus a totals line.
    pub fn log_summary(&self) {
        for outcome in self.failed() {
            if let TargetStatus::Failed { stage, message } = &outcome.status {
                let target = outcome.target;
                error!(%target, %stage, "{}", message);
            }
        }
        info!(
            built = self.succeeded().count(),
            failed = self.failed().count(),
            "Build finished"
        );
    }
}

/// One write-once slot per dispatched task.
///
/// Tasks complete in any order; each writes only its own slot, and the
/// report is assembled once every slot is filled.
#[derive(Debug)]
pub struct CompletionLedger {
    slots: Vec<OnceLock<TargetOutcome>>,
}

impl CompletionLedger {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Records the outcome of task `index`.
    ///
    /// Returns `false` if the index is out of range or already completed.
    pub fn complete(&self, index: usize, outcome: TargetOutcome) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.set(outcome).is_ok())
    }

    pub fn completed(&self) -> usize {
        self.slots.iter().filter(|s| s.get().is_some()).count()
    }

    /// Collects exactly one outcome per slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilesystemInconsistency`] naming the first slot that
    /// never completed.
    pub fn into_report(self) -> Result<BuildReport> {
        let outcomes = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.into_inner().ok_or_else(|| {
                    Error::FilesystemInconsistency(format!("build task {} never completed", index))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BuildReport { outcomes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::target::default_targets;
    use proptest::prelude::*;

    fn built(target: BuildTarget) -> TargetOutcome {
        TargetOutcome {
            target,
            status: TargetStatus::Built {
                binary: PathBuf::from(target.file_name("app-")),
                label: target.to_string(),
                archive: None,
            },
        }
    }

    #[test]
    fn test_slot_is_write_once() {
        let target = default_targets()[0];
        let ledger = CompletionLedger::new(1);

        assert!(ledger.complete(0, built(target)));
        assert!(!ledger.complete(0, built(target)));
        assert!(!ledger.complete(1, built(target)));
        assert_eq!(ledger.completed(), 1);
    }

    #[test]
    fn test_missing_slot_is_error() {
        let ledger = CompletionLedger::new(2);
        ledger.complete(1, built(default_targets()[1]));
        assert!(matches!(
            ledger.into_report(),
            Err(Error::FilesystemInconsistency(_))
        ));
    }

    #[test]
    fn test_report_partitions() {
        let targets = default_targets();
        let ledger = CompletionLedger::new(2);
        ledger.complete(0, built(targets[0]));
        ledger.complete(
            1,
            TargetOutcome::failed(
                targets[1],
                FailureStage::Compile,
                &Error::Compile {
                    target: targets[1].to_string(),
                    diagnostic: "boom".into(),
                },
            ),
        );

        let report = ledger.into_report().unwrap();
        assert_eq!(report.len(), 2);
        assert!(!report.all_succeeded());
        assert_eq!(report.succeeded().count(), 1);
        assert_eq!(report.failed().next().unwrap().target, targets[1]);
    }

    proptest! {
        #[test]
        fn completion_order_does_not_change_report(
            order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let targets = default_targets();

            let ledger = CompletionLedger::new(targets.len());
            for &i in &order {
                prop_assert!(ledger.complete(i, built(targets[i])));
            }
            let report = ledger.into_report().unwrap();

            let expected: Vec<_> = targets.iter().map(|t| built(*t)).collect();
            prop_assert_eq!(report.outcomes(), &expected[..]);
        }
    }
}
