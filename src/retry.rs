use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ItemError, PipelineError};
use crate::ledger::{
    AttemptOutcome, ItemPayload, ItemState, LedgerEntry, LedgerSnapshot, RejectionList,
};

/// Retry budget and backoff shared by both stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before an item is rejected. An item that
    /// always fails is attempted `max_retries + 1` times.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// delay = base_delay_ms * 2^(attempt - 1), capped at max_delay_ms.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// What happens to an item after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Terminal success.
    Done,
    /// Back to `pending`; eligible again after `delay`.
    Retry { delay: Duration, error: ItemError },
    /// Retry budget exhausted; terminal.
    Rejected(ItemError),
}

/// Turns attempt outcomes into ledger transitions.
pub struct RetryCoordinator {
    policy: RetryPolicy,
    rejections: RejectionList,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy, rejections: RejectionList) -> Self {
        Self { policy, rejections }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn rejections(&self) -> &RejectionList {
        &self.rejections
    }

    /// Applies the outcome of the open attempt to `entry` and returns the
    /// decision. The caller persists the entry, then calls
    /// [`record_rejection`](Self::record_rejection) for `Rejected`.
    pub fn resolve(
        &self,
        entry: &mut LedgerEntry,
        result: Result<ItemPayload, ItemError>,
    ) -> Decision {
        entry.attempt_count += 1;
        match result {
            Ok(payload) => {
                entry.finish_attempt(AttemptOutcome::Success, None);
                entry.state = ItemState::Done;
                entry.last_error = None;
                entry.output_path = Some(payload.output_path);
                entry.detail = Some(payload.detail);
                Decision::Done
            }
            Err(error) => {
                entry.finish_attempt(AttemptOutcome::Failure, Some(error.class));
                entry.last_error = Some(error.to_string());
                if entry.attempt_count <= self.policy.max_retries {
                    entry.state = ItemState::Pending;
                    Decision::Retry {
                        delay: self.policy.delay_for_attempt(entry.attempt_count),
                        error,
                    }
                } else {
                    entry.state = ItemState::FailedPermanent;
                    Decision::Rejected(error)
                }
            }
        }
    }

    /// Rejects a `pending` entry whose finished attempts already exceed the
    /// budget, as happens when a rerun lowers `max_retries`. Returns `false`
    /// and leaves the entry alone when it may still be attempted.
    pub fn reject_exhausted(&self, entry: &mut LedgerEntry) -> bool {
        if entry.state != ItemState::Pending || entry.attempt_count <= self.policy.max_retries {
            return false;
        }
        entry.state = ItemState::FailedPermanent;
        entry.last_updated = chrono::Utc::now();
        if entry.last_error.is_none() {
            entry.last_error = Some(format!(
                "retry budget exhausted after {} attempts",
                entry.attempt_count
            ));
        }
        true
    }

    pub fn record_rejection(&self, entry: &LedgerEntry) -> Result<(), PipelineError> {
        if self.rejections.append(entry)? {
            warn!(
                identity = %entry.identity,
                attempts = entry.attempt_count,
                "item rejected after exhausting retries"
            );
        }
        Ok(())
    }

    /// Adds `failed-permanent` entries missing from the rejection list, which
    /// happens if the process died between the ledger write and the append.
    pub fn reconcile(&self, snapshot: &LedgerSnapshot) -> Result<usize, PipelineError> {
        let mut added = 0;
        for entry in snapshot.in_state(ItemState::FailedPermanent) {
            if self.rejections.append(entry)? {
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "rejection list reconciled with ledger");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::ledger::WorkItem;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir, max_retries: u32) -> RetryCoordinator {
        let rejections = RejectionList::open(dir.path().join("retry_list.csv")).unwrap();
        RetryCoordinator::new(
            RetryPolicy {
                max_retries,
                ..Default::default()
            },
            rejections,
        )
    }

    fn entry() -> LedgerEntry {
        LedgerEntry::new(&WorkItem {
            identity: "ep | show".into(),
            input: "https://example.com/ep.mp3".into(),
            output: PathBuf::from("ep.mp3"),
            label: "ep".into(),
        })
    }

    fn failure() -> Result<ItemPayload, ItemError> {
        Err(ItemError::new(FailureClass::Network, "connection reset"))
    }

    fn success() -> Result<ItemPayload, ItemError> {
        Ok(ItemPayload {
            output_path: PathBuf::from("ep.mp3"),
            detail: "1.0M".into(),
        })
    }

    #[test]
    fn success_is_terminal() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, 3);
        let mut entry = entry();
        entry.begin_attempt("run");

        assert_eq!(coord.resolve(&mut entry, success()), Decision::Done);
        assert_eq!(entry.state, ItemState::Done);
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.output_path, Some(PathBuf::from("ep.mp3")));
        assert_eq!(entry.attempts[0].outcome, AttemptOutcome::Success);
    }

    #[test]
    fn failures_retry_then_reject() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, 2);
        let mut entry = entry();

        for expected in 1..=2 {
            entry.begin_attempt("run");
            let decision = coord.resolve(&mut entry, failure());
            assert!(matches!(decision, Decision::Retry { .. }));
            assert_eq!(entry.state, ItemState::Pending);
            assert_eq!(entry.attempt_count, expected);
        }

        entry.begin_attempt("run");
        let decision = coord.resolve(&mut entry, failure());
        assert!(matches!(decision, Decision::Rejected(_)));
        assert_eq!(entry.state, ItemState::FailedPermanent);
        assert_eq!(entry.attempt_count, 3);
        assert_eq!(
            entry.last_error.as_deref(),
            Some("network: connection reset")
        );
    }

    #[test]
    fn zero_retries_rejects_immediately() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, 0);
        let mut entry = entry();
        entry.begin_attempt("run");

        assert!(matches!(
            coord.resolve(&mut entry, failure()),
            Decision::Rejected(_)
        ));
        assert_eq!(entry.attempt_count, 1);
    }

    #[test]
    fn retry_then_succeed_clears_error() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, 3);
        let mut entry = entry();

        entry.begin_attempt("run");
        coord.resolve(&mut entry, failure());
        assert!(entry.last_error.is_some());

        entry.begin_attempt("run");
        assert_eq!(coord.resolve(&mut entry, success()), Decision::Done);
        assert!(entry.last_error.is_none());
        assert_eq!(entry.attempt_count, 2);
    }

    #[test]
    fn lowered_budget_rejects_exhausted_pending_entry() {
        let dir = TempDir::new().unwrap();
        let generous = coordinator(&dir, 5);
        let mut entry = entry();
        for _ in 0..3 {
            entry.begin_attempt("run");
            generous.resolve(&mut entry, failure());
        }
        assert_eq!(entry.state, ItemState::Pending);
        assert!(!generous.reject_exhausted(&mut entry));

        let strict = coordinator(&dir, 1);
        assert!(strict.reject_exhausted(&mut entry));
        assert_eq!(entry.state, ItemState::FailedPermanent);
        assert_eq!(entry.attempt_count, 3);
        assert_eq!(
            entry.last_error.as_deref(),
            Some("network: connection reset")
        );
    }

    #[test]
    fn exhaustion_check_ignores_fresh_and_finished_entries() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, 0);

        let mut fresh = entry();
        assert!(!coord.reject_exhausted(&mut fresh));
        assert_eq!(fresh.state, ItemState::Pending);

        let mut done = entry();
        done.attempt_count = 4;
        done.state = ItemState::Done;
        assert!(!coord.reject_exhausted(&mut done));
        assert_eq!(done.state, ItemState::Done);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(5000));
    }

    #[test]
    fn reconcile_adds_missing_rejections_once() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, 0);
        let ledger = crate::ledger::Ledger::load(dir.path().join("ledger")).unwrap();
        let mut failed = entry();
        ledger
            .register(&[WorkItem {
                identity: failed.identity.clone(),
                input: failed.input.clone(),
                output: PathBuf::from("ep.mp3"),
                label: "ep".into(),
            }])
            .unwrap();
        failed.state = ItemState::FailedPermanent;
        ledger.upsert(failed).unwrap();

        assert_eq!(coord.reconcile(&ledger.snapshot()).unwrap(), 1);
        assert_eq!(coord.reconcile(&ledger.snapshot()).unwrap(), 0);
        assert_eq!(coord.rejections().rows().len(), 1);
    }
}
