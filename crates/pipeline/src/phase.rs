use ballast_common::{DispatchError, HostError, WorldHost};
use serde::Serialize;

/// Errors crossing a phase boundary. The runner logs them and moves on.
#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("host call failed: {0}")]
    Host(#[from] HostError),
    #[error("mutation queue unavailable: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("{domain} is disabled")]
    Disabled { domain: &'static str },
    #[error("invalid input: {0}")]
    Invalid(String),
}

/// Outcome counts of one Apply phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Targets the mutation was applied to.
    pub applied: usize,
    /// Targets that no longer qualified or no longer exist.
    pub skipped: usize,
    /// Targets whose host call failed.
    pub failed: usize,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.failed
    }
}

/// Per-target result reported by an Apply step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    Skipped,
}

/// A subsystem expressed as snapshot, compute and apply.
///
/// `snapshot` and `apply` run on the mutation context and are the only
/// phases allowed to touch the host. `compute` runs on a background worker
/// over the snapshot and the domain's own bookkeeping.
pub trait Domain: Send + Sync + 'static {
    type Snapshot: Send + 'static;
    type Decision: Send + 'static;

    fn name(&self) -> &'static str;

    fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError>;

    fn compute(&self, snapshot: Self::Snapshot) -> Result<Self::Decision, PhaseError>;

    /// Apply the decision, re-validating every target first.
    fn apply(
        &self,
        host: &mut dyn WorldHost,
        decision: Self::Decision,
    ) -> Result<ApplyReport, PhaseError>;

    /// Decisions that need no Apply phase are not queued.
    fn is_noop(&self, _decision: &Self::Decision) -> bool {
        false
    }
}

/// Run `act` for every target in isolation.
///
/// A vanished object counts as skipped, any other host failure as failed;
/// both are logged at debug and the batch continues.
pub fn apply_each<T: std::fmt::Debug>(
    domain: &'static str,
    targets: impl IntoIterator<Item = T>,
    mut act: impl FnMut(&T) -> Result<Applied, HostError>,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    for target in targets {
        match act(&target) {
            Ok(Applied::Done) => report.applied += 1,
            Ok(Applied::Skipped) => report.skipped += 1,
            Err(HostError::NotFound(id)) => {
                tracing::debug!(domain, ?id, "target vanished before apply");
                report.skipped += 1;
            }
            Err(err) => {
                tracing::debug!(domain, ?target, %err, "apply failed for target");
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_common::ObjectId;

    #[test]
    fn apply_each_isolates_failures() {
        let vanished = ObjectId::new();
        let report = apply_each("test", 0..5, |i| match *i {
            0 | 1 => Ok(Applied::Done),
            2 => Ok(Applied::Skipped),
            3 => Err(HostError::NotFound(vanished)),
            _ => Err(HostError::Unsupported("teleport")),
        });
        assert_eq!(
            report,
            ApplyReport {
                applied: 2,
                skipped: 2,
                failed: 1
            }
        );
        assert_eq!(report.total(), 5);
    }

    #[test]
    fn reports_merge() {
        let mut a = ApplyReport {
            applied: 1,
            skipped: 2,
            failed: 3,
        };
        a.merge(a);
        assert_eq!(a.total(), 12);
    }
}
