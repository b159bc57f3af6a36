use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{FailureClass, ItemError, PipelineError};
use crate::ledger::{ItemPayload, ItemState, Ledger, LedgerEntry, WorkItem};
use crate::retry::{Decision, RetryCoordinator};

/// The per-item work a stage performs (a download, a transcription).
///
/// Implementations must overwrite any partial output left by an earlier
/// attempt, since an interrupted item is retried from scratch.
pub trait ItemOperation: Send + Sync + 'static {
    fn run(
        &self,
        item: &WorkItem,
    ) -> impl Future<Output = Result<ItemPayload, ItemError>> + Send;
}

/// Counters for one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub rejected: usize,
    /// Items whose entry was not `pending` when their turn came.
    pub skipped: usize,
    /// Items still queued when the run stopped.
    pub remaining: usize,
    pub interrupted: bool,
}

struct Scheduled {
    item: WorkItem,
    not_before: Instant,
}

type Finished = (WorkItem, Result<ItemPayload, ItemError>);

/// What `dispatch` did with an item taken from the queue.
enum Dispatch {
    Started,
    /// The entry was not `pending`.
    Skipped,
    /// The entry had already used up the current retry budget.
    Rejected,
}

/// Runs an [`ItemOperation`] over a queue of items with at most `workers`
/// attempts in flight.
///
/// Every transition is written to the ledger before the item is considered
/// again. Operation errors and panics are contained per item; systemic
/// errors and ledger write failures stop dispatching, let in-flight items
/// finish, and are returned.
pub struct WorkerPool<O> {
    workers: usize,
    run_id: String,
    ledger: Arc<Ledger>,
    retry: Arc<RetryCoordinator>,
    operation: Arc<O>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<O: ItemOperation> WorkerPool<O> {
    pub fn new(
        workers: usize,
        ledger: Arc<Ledger>,
        retry: Arc<RetryCoordinator>,
        operation: Arc<O>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            run_id: Uuid::new_v4().to_string(),
            ledger,
            retry,
            operation,
            shutdown: None,
        }
    }

    /// Stops dispatching once `true` is sent on the channel.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run(
        &self,
        items: impl IntoIterator<Item = WorkItem>,
    ) -> Result<PoolReport, PipelineError> {
        let start = Instant::now();
        let mut queue: VecDeque<Scheduled> = items
            .into_iter()
            .map(|item| Scheduled {
                item,
                not_before: start,
            })
            .collect();
        let mut shutdown = self.shutdown.clone();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut report = PoolReport::default();
        let mut halt: Option<PipelineError> = None;

        info!(
            run_id = %self.run_id,
            items = queue.len(),
            workers = self.workers,
            "worker pool started"
        );

        if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
            report.interrupted = true;
        }

        loop {
            let stopping = halt.is_some() || report.interrupted;

            if !stopping {
                while tasks.len() < self.workers {
                    let Some(item) = take_ready(&mut queue, &in_flight, Instant::now()) else {
                        break;
                    };
                    match self.dispatch(item, &mut tasks, &mut in_flight) {
                        Ok(Dispatch::Started) => report.dispatched += 1,
                        Ok(Dispatch::Skipped) => report.skipped += 1,
                        Ok(Dispatch::Rejected) => report.rejected += 1,
                        Err(e) => {
                            halt = Some(e);
                            break;
                        }
                    }
                }
            }

            let stopping = halt.is_some() || report.interrupted;
            if tasks.is_empty() && (stopping || queue.is_empty()) {
                break;
            }

            let next_due = if tasks.len() < self.workers {
                queue
                    .iter()
                    .filter(|s| !in_flight.contains(&s.item.identity))
                    .map(|s| s.not_before)
                    .min()
            } else {
                None
            };

            tokio::select! {
                Some(joined) = tasks.join_next() => match joined {
                    Ok((item, result)) => {
                        in_flight.remove(&item.identity);
                        if let Err(e) = self.complete(item, result, &mut queue, &mut report) {
                            halt.get_or_insert(e);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "worker task failed outside the item boundary");
                        halt.get_or_insert(PipelineError::Worker(e.to_string()));
                    }
                },
                _ = sleep_until(next_due.unwrap_or(start)), if next_due.is_some() && !stopping => {}
                _ = wait_for_shutdown(&mut shutdown), if !stopping => {
                    info!(in_flight = tasks.len(), "shutdown requested, draining in-flight items");
                    report.interrupted = true;
                }
                else => break,
            }
        }

        report.remaining = queue.len();
        info!(
            run_id = %self.run_id,
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            retried = report.retried,
            rejected = report.rejected,
            remaining = report.remaining,
            interrupted = report.interrupted,
            "worker pool finished"
        );

        match halt {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Marks the item in-progress and spawns its attempt. Entries that are
    /// not `pending`, or that are out of attempts under the current policy,
    /// are settled here without running the operation.
    fn dispatch(
        &self,
        item: WorkItem,
        tasks: &mut JoinSet<Finished>,
        in_flight: &mut HashSet<String>,
    ) -> Result<Dispatch, PipelineError> {
        let mut entry = self.current_entry(&item);
        if entry.state != ItemState::Pending {
            debug!(identity = %item.identity, state = %entry.state, "not pending, skipping");
            return Ok(Dispatch::Skipped);
        }
        if self.retry.reject_exhausted(&mut entry) {
            self.ledger.upsert(entry.clone())?;
            self.retry.record_rejection(&entry)?;
            warn!(
                identity = %item.identity,
                attempts = entry.attempt_count,
                max_retries = self.retry.policy().max_retries,
                "retry budget already spent, rejecting without another attempt"
            );
            return Ok(Dispatch::Rejected);
        }
        let attempt = entry.begin_attempt(&self.run_id);
        self.ledger.upsert(entry)?;
        debug!(identity = %item.identity, attempt, "dispatching");

        in_flight.insert(item.identity.clone());
        let operation = Arc::clone(&self.operation);
        tasks.spawn(async move {
            let attempt_item = item.clone();
            let handle = tokio::spawn(async move { operation.run(&attempt_item).await });
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ItemError::new(FailureClass::Crashed, e.to_string())),
            };
            (item, result)
        });
        Ok(Dispatch::Started)
    }

    fn complete(
        &self,
        item: WorkItem,
        result: Result<ItemPayload, ItemError>,
        queue: &mut VecDeque<Scheduled>,
        report: &mut PoolReport,
    ) -> Result<(), PipelineError> {
        let mut entry = self.current_entry(&item);

        if let Err(error) = &result
            && error.is_systemic()
        {
            error!(identity = %item.identity, %error, "systemic failure, halting pool");
            entry.release_interrupted();
            self.ledger.upsert(entry)?;
            return Err(PipelineError::Systemic {
                identity: item.identity,
                error: error.clone(),
            });
        }

        let decision = self.retry.resolve(&mut entry, result);
        self.ledger.upsert(entry.clone())?;

        match decision {
            Decision::Done => {
                report.succeeded += 1;
                info!(
                    identity = %item.identity,
                    attempts = entry.attempt_count,
                    detail = entry.detail.as_deref().unwrap_or(""),
                    "item done"
                );
            }
            Decision::Retry { delay, error } => {
                report.retried += 1;
                warn!(
                    identity = %item.identity,
                    attempt = entry.attempt_count,
                    max_retries = self.retry.policy().max_retries,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "attempt failed, will retry"
                );
                queue.push_back(Scheduled {
                    item,
                    not_before: Instant::now() + delay,
                });
            }
            Decision::Rejected(error) => {
                report.rejected += 1;
                self.retry.record_rejection(&entry)?;
                warn!(identity = %item.identity, %error, "item failed permanently");
            }
        }
        Ok(())
    }

    fn current_entry(&self, item: &WorkItem) -> LedgerEntry {
        self.ledger
            .get(&item.identity)
            .unwrap_or_else(|| LedgerEntry::new(item))
    }
}

/// Removes the first queued item that is due and not already in flight.
fn take_ready(
    queue: &mut VecDeque<Scheduled>,
    in_flight: &HashSet<String>,
    now: Instant,
) -> Option<WorkItem> {
    let index = queue
        .iter()
        .position(|s| s.not_before <= now && !in_flight.contains(&s.item.identity))?;
    queue.remove(index).map(|s| s.item)
}

async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            if rx.wait_for(|stop| *stop).await.is_err() {
                // Sender gone without a shutdown request.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RejectionList;
    use crate::retry::RetryPolicy;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeOperation {
        /// Identities that always fail with this class.
        failing: HashMap<String, FailureClass>,
        /// Identities that fail this many times before succeeding.
        flaky: HashMap<String, u32>,
        panicking: HashSet<String>,
        calls: Mutex<HashMap<String, u32>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        /// Start of every call, in order.
        log: Mutex<Vec<(String, Instant)>>,
    }

    impl FakeOperation {
        fn calls(&self, identity: &str) -> u32 {
            self.calls.lock().unwrap().get(identity).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> u32 {
            self.calls.lock().unwrap().values().sum()
        }
    }

    impl ItemOperation for FakeOperation {
        async fn run(&self, item: &WorkItem) -> Result<ItemPayload, ItemError> {
            self.log
                .lock()
                .unwrap()
                .push((item.identity.clone(), Instant::now()));
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(item.identity.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panicking.contains(&item.identity) {
                panic!("operation blew up");
            }
            if let Some(class) = self.failing.get(&item.identity) {
                return Err(ItemError::new(*class, "scripted failure"));
            }
            if let Some(failures) = self.flaky.get(&item.identity)
                && call <= *failures
            {
                return Err(ItemError::new(FailureClass::Network, "flaky"));
            }
            Ok(ItemPayload {
                output_path: item.output.clone(),
                detail: format!("call {call}"),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        ledger: Arc<Ledger>,
        retry: Arc<RetryCoordinator>,
        rejections_path: PathBuf,
    }

    fn fixture(max_retries: u32) -> Fixture {
        fixture_with(RetryPolicy {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
        })
    }

    fn fixture_with(policy: RetryPolicy) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::load(dir.path().join("ledger")).unwrap());
        let rejections_path = dir.path().join("retry_list.csv");
        let retry = Arc::new(RetryCoordinator::new(
            policy,
            RejectionList::open(&rejections_path).unwrap(),
        ));
        Fixture {
            _dir: dir,
            ledger,
            retry,
            rejections_path,
        }
    }

    fn items(names: &[&str]) -> Vec<WorkItem> {
        names
            .iter()
            .map(|n| WorkItem {
                identity: n.to_string(),
                input: format!("https://example.com/{n}.mp3"),
                output: PathBuf::from(format!("{n}.mp3")),
                label: n.to_string(),
            })
            .collect()
    }

    fn pool(fx: &Fixture, workers: usize, op: &Arc<FakeOperation>) -> WorkerPool<FakeOperation> {
        WorkerPool::new(workers, fx.ledger.clone(), fx.retry.clone(), op.clone())
    }

    #[tokio::test]
    async fn processes_every_item() {
        let fx = fixture(3);
        let op = Arc::new(FakeOperation::default());

        let report = pool(&fx, 4, &op).run(items(&["a", "b", "c"])).await.unwrap();

        assert_eq!(report.dispatched, 3);
        assert_eq!(report.succeeded, 3);
        let snapshot = fx.ledger.snapshot();
        assert_eq!(snapshot.counts().done, 3);
        assert_eq!(
            snapshot.get("b").unwrap().output_path,
            Some(PathBuf::from("b.mp3"))
        );
    }

    #[tokio::test]
    async fn always_failing_item_is_rejected_after_budget() {
        let fx = fixture(2);
        let op = Arc::new(FakeOperation {
            failing: HashMap::from([("bad".to_string(), FailureClass::MalformedUrl)]),
            ..Default::default()
        });

        let report = pool(&fx, 2, &op).run(items(&["a", "bad", "c"])).await.unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.retried, 2);
        assert_eq!(op.calls("bad"), 3);
        let entry = fx.ledger.get("bad").unwrap();
        assert_eq!(entry.state, ItemState::FailedPermanent);
        assert_eq!(entry.attempt_count, 3);

        let rejected = RejectionList::read(&fx.rejections_path).unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].identity, "bad");
    }

    #[tokio::test]
    async fn flaky_item_recovers_within_budget() {
        let fx = fixture(3);
        let op = Arc::new(FakeOperation {
            flaky: HashMap::from([("a".to_string(), 2)]),
            ..Default::default()
        });

        let report = pool(&fx, 1, &op).run(items(&["a"])).await.unwrap();

        assert_eq!(report.retried, 2);
        assert_eq!(report.succeeded, 1);
        let entry = fx.ledger.get("a").unwrap();
        assert_eq!(entry.state, ItemState::Done);
        assert_eq!(entry.attempt_count, 3);
        assert_eq!(entry.attempts.len(), 3);
    }

    #[tokio::test]
    async fn panics_are_contained_per_item() {
        let fx = fixture(0);
        let op = Arc::new(FakeOperation {
            panicking: HashSet::from(["boom".to_string()]),
            ..Default::default()
        });

        let report = pool(&fx, 2, &op).run(items(&["a", "boom", "b"])).await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.rejected, 1);
        let entry = fx.ledger.get("boom").unwrap();
        assert_eq!(entry.state, ItemState::FailedPermanent);
        assert_eq!(entry.attempts[0].error_class, Some(FailureClass::Crashed));
    }

    #[tokio::test]
    async fn never_exceeds_worker_count() {
        let fx = fixture(0);
        let op = Arc::new(FakeOperation {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let names: Vec<String> = (0..12).map(|i| format!("item-{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();

        pool(&fx, 3, &op).run(items(&refs)).await.unwrap();

        assert!(op.peak.load(Ordering::SeqCst) <= 3);
        assert!(op.peak.load(Ordering::SeqCst) >= 2);
        assert_eq!(fx.ledger.snapshot().counts().done, 12);
    }

    #[tokio::test]
    async fn duplicate_identity_is_not_run_twice() {
        let fx = fixture(0);
        let op = Arc::new(FakeOperation {
            delay: Duration::from_millis(10),
            ..Default::default()
        });

        let report = pool(&fx, 4, &op).run(items(&["a", "a"])).await.unwrap();

        assert_eq!(op.calls("a"), 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn done_items_are_not_attempted_again() {
        let fx = fixture(1);
        let op = Arc::new(FakeOperation::default());
        pool(&fx, 2, &op).run(items(&["a", "b"])).await.unwrap();
        assert_eq!(op.total_calls(), 2);

        let report = pool(&fx, 2, &op).run(items(&["a", "b"])).await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(op.total_calls(), 2);
    }

    #[tokio::test]
    async fn systemic_error_halts_and_releases_item() {
        let fx = fixture(3);
        let op = Arc::new(FakeOperation {
            failing: HashMap::from([("disk".to_string(), FailureClass::StorageFull)]),
            ..Default::default()
        });

        let err = pool(&fx, 1, &op)
            .run(items(&["disk", "later"]))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Systemic { .. }));
        let entry = fx.ledger.get("disk").unwrap();
        assert_eq!(entry.state, ItemState::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(op.calls("later"), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_dispatching() {
        let fx = fixture(0);
        let op = Arc::new(FakeOperation::default());
        let (tx, rx) = watch::channel(true);

        let report = pool(&fx, 2, &op)
            .with_shutdown(rx)
            .run(items(&["a", "b"]))
            .await
            .unwrap();
        drop(tx);

        assert!(report.interrupted);
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(op.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_backoff_without_blocking_other_items() {
        let fx = fixture_with(RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        });
        let op = Arc::new(FakeOperation {
            flaky: HashMap::from([("a".to_string(), 1)]),
            ..Default::default()
        });
        let start = Instant::now();

        let report = pool(&fx, 1, &op).run(items(&["a", "b", "c"])).await.unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.succeeded, 3);
        let log = op.log.lock().unwrap().clone();
        let order: Vec<&str> = log.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, ["a", "b", "c", "a"]);

        let backoff = Duration::from_millis(1000);
        assert!(log[1].1 < start + backoff, "b waited for a's backoff");
        assert!(log[2].1 < start + backoff, "c waited for a's backoff");
        assert!(log[3].1 >= start + backoff, "a retried before its backoff");
        assert!(log[3].1 < start + backoff * 2);
    }

    #[tokio::test]
    async fn lowered_budget_rejects_spent_items_at_dispatch() {
        let generous = fixture(5);
        let op = Arc::new(FakeOperation {
            failing: HashMap::from([("bad".to_string(), FailureClass::Network)]),
            ..Default::default()
        });
        // Leave "bad" pending with two failed attempts on record.
        let mut entry = LedgerEntry::new(&items(&["bad"])[0]);
        for _ in 0..2 {
            entry.begin_attempt("earlier-run");
            generous
                .retry
                .resolve(&mut entry, Err(ItemError::new(FailureClass::Network, "reset")));
        }
        generous.ledger.upsert(entry).unwrap();
        assert_eq!(generous.ledger.get("bad").unwrap().state, ItemState::Pending);

        let strict = Arc::new(RetryCoordinator::new(
            RetryPolicy {
                max_retries: 1,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            RejectionList::open(&generous.rejections_path).unwrap(),
        ));
        let report = WorkerPool::new(2, generous.ledger.clone(), strict, op.clone())
            .run(items(&["bad", "a"]))
            .await
            .unwrap();

        assert_eq!(op.calls("bad"), 0);
        assert_eq!(op.calls("a"), 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.dispatched, 1);
        let entry = generous.ledger.get("bad").unwrap();
        assert_eq!(entry.state, ItemState::FailedPermanent);
        assert_eq!(entry.attempt_count, 2);
        let rejected = RejectionList::read(&generous.rejections_path).unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].identity, "bad");
    }

    #[tokio::test]
    async fn final_state_is_independent_of_worker_count() {
        let names = ["a", "b", "bad", "c", "d", "e", "f", "g"];
        let mut finals = Vec::new();
        for workers in [1, 8] {
            let fx = fixture(1);
            let op = Arc::new(FakeOperation {
                failing: HashMap::from([("bad".to_string(), FailureClass::NotFound)]),
                flaky: HashMap::from([("c".to_string(), 1)]),
                ..Default::default()
            });
            pool(&fx, workers, &op).run(items(&names)).await.unwrap();
            let states: Vec<(String, ItemState, u32)> = fx
                .ledger
                .snapshot()
                .entries()
                .map(|e| (e.identity.clone(), e.state, e.attempt_count))
                .collect();
            finals.push(states);
        }
        assert_eq!(finals[0], finals[1]);
    }
}
