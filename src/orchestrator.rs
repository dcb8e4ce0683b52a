//! Run orchestration.
//!
//! The orchestrator owns the worker pool: one task per partition, bounded by
//! a semaphore sized to what the origin tolerates. Within a partition all
//! work is strictly sequential on that partition's worker; across partitions
//! no ordering exists. A worker failure triggers whole-worker restarts
//! (fresh session, fresh authentication) up to a configured budget before
//! the partition is marked failed for the run, without blocking the others.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConcurrencyConfig, PacingConfig, ScanConfig};
use crate::error::{HarvestError, Result};
use crate::gaps::gap_set;
use crate::identifier::Partition;
use crate::report::{PartitionReport, PartitionStats, Reporter, RunSummary};
use crate::search::QueryStyle;
use crate::store::{CaseStore, SaveStatus};
use crate::worker::{PartitionWorker, SearchOutcome, WorkerFactory};

/// What a run does with each partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Forward-scan from the last persisted number.
    Parse,
    /// Replay every persisted number to refresh stored records.
    Update,
    /// Recompute the gap set and replay exactly those numbers.
    Gaps,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Update => "update",
            Self::Gaps => "gaps",
        }
    }
}

impl FromStr for RunMode {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parse" => Ok(Self::Parse),
            "update" => Ok(Self::Update),
            "gaps" => Ok(Self::Gaps),
            other => Err(HarvestError::Config(format!("unknown mode: {other}"))),
        }
    }
}

/// Coordinates partition workers for one run.
pub struct Orchestrator<F: WorkerFactory> {
    factory: Arc<F>,
    store: Arc<dyn CaseStore>,
    reporter: Arc<dyn Reporter>,
    partitions: Vec<Partition>,
    scan: ScanConfig,
    pacing: PacingConfig,
    concurrency: ConcurrencyConfig,
    shutdown: CancellationToken,
}

impl<F> Orchestrator<F>
where
    F: WorkerFactory + Send + Sync + 'static,
    F::Worker: Send,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: Arc<F>,
        store: Arc<dyn CaseStore>,
        reporter: Arc<dyn Reporter>,
        partitions: Vec<Partition>,
        scan: ScanConfig,
        pacing: PacingConfig,
        concurrency: ConcurrencyConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            factory,
            store,
            reporter,
            partitions,
            scan,
            pacing,
            concurrency,
            shutdown,
        }
    }

    /// Token that stops the run when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Execute one run over all configured partitions.
    pub async fn run(&self, mode: RunMode) -> RunSummary {
        let started_at = Utc::now();
        info!(mode = mode.as_str(), partitions = self.partitions.len(),
              max_parallel = self.concurrency.max_parallel_regions, "run started");

        let semaphore = Arc::new(Semaphore::new(self.concurrency.max_parallel_regions));
        let mut tasks: JoinSet<PartitionReport> = JoinSet::new();

        for partition in self.partitions.clone() {
            let context = PartitionContext {
                factory: Arc::clone(&self.factory),
                store: Arc::clone(&self.store),
                reporter: Arc::clone(&self.reporter),
                partition,
                mode,
                scan: self.scan.clone(),
                pacing: self.pacing.clone(),
                restart_attempts: self.concurrency.worker_restart_attempts,
                shutdown: self.shutdown.clone(),
                semaphore: Arc::clone(&semaphore),
            };
            tasks.spawn(context.run());
        }

        let mut reports = Vec::new();
        let interrupted = self.collect(&mut tasks, &mut reports).await;

        let summary = RunSummary {
            mode: mode.as_str().to_string(),
            started_at,
            finished_at: Utc::now(),
            partitions: reports,
            interrupted,
        };
        self.reporter.run_finished(&summary);
        summary
    }

    /// Join partition tasks; on shutdown, drain in-flight work within the
    /// grace period, then abort whatever remains.
    async fn collect(
        &self,
        tasks: &mut JoinSet<PartitionReport>,
        reports: &mut Vec<PartitionReport>,
    ) -> bool {
        let mut interrupted = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(err)) => error!(error = %err, "partition task failed to join"),
                    None => return interrupted,
                },
                _ = self.shutdown.cancelled() => {
                    interrupted = true;
                    break;
                }
            }
        }

        info!(grace_ms = self.concurrency.shutdown_grace_ms,
              "shutdown requested, draining in-flight partitions");
        let deadline = tokio::time::Instant::now() + self.concurrency.shutdown_grace();
        let mut aborted = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(err)) => {
                        if !err.is_cancelled() {
                            error!(error = %err, "partition task failed to join");
                        }
                    }
                    None => return true,
                },
                _ = tokio::time::sleep_until(deadline), if !aborted => {
                    warn!("grace period elapsed, force-cancelling remaining partitions");
                    tasks.abort_all();
                    aborted = true;
                }
            }
        }
    }
}

/// Work source for one partition run.
enum Work {
    /// Fixed list of sequence numbers, already planned.
    List(std::vec::IntoIter<u32>),
    /// Open-ended forward scan.
    Scan { next: u32, empties: u32 },
}

struct PartitionContext<F: WorkerFactory> {
    factory: Arc<F>,
    store: Arc<dyn CaseStore>,
    reporter: Arc<dyn Reporter>,
    partition: Partition,
    mode: RunMode,
    scan: ScanConfig,
    pacing: PacingConfig,
    restart_attempts: u32,
    shutdown: CancellationToken,
    semaphore: Arc<Semaphore>,
}

impl<F> PartitionContext<F>
where
    F: WorkerFactory,
{
    async fn run(self) -> PartitionReport {
        let key = self.partition.key.clone();
        let mut stats = PartitionStats::default();

        let Ok(_permit) = self.semaphore.acquire().await else {
            return PartitionReport {
                partition: key,
                stats,
                failed: true,
                failure: Some("worker pool closed".into()),
            };
        };
        if self.shutdown.is_cancelled() {
            return PartitionReport {
                partition: key,
                stats,
                failed: false,
                failure: None,
            };
        }

        self.reporter.partition_started(&key);
        let result = self.process(&mut stats).await;

        let (failed, failure) = match result {
            Ok(()) => {
                self.reporter.partition_finished(&key, &stats);
                (false, None)
            }
            Err(err) => {
                self.reporter.partition_failed(&key, &err.to_string());
                (true, Some(err.to_string()))
            }
        };
        PartitionReport {
            partition: key,
            stats,
            failed,
            failure,
        }
    }

    async fn process(&self, stats: &mut PartitionStats) -> Result<()> {
        let style = match self.mode {
            RunMode::Update => QueryStyle::SequenceOnly,
            RunMode::Parse | RunMode::Gaps => QueryStyle::FullNumber,
        };
        let mut work = self.plan().await?;
        let mut restarts = 0u32;

        let mut worker = self.spawn_worker(stats, &mut restarts).await?;
        let mut pending: Option<u32> = None;

        let result = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }
            let Some(sequence) = pending.take().or_else(|| self.next_number(&mut work)) else {
                break Ok(());
            };

            match worker.search_and_save(sequence, style).await {
                Ok(outcome) => {
                    stats.queries += 1;
                    self.account(outcome, &mut work, stats);
                    self.reporter.progress(&self.partition.key, stats);
                    tokio::select! {
                        _ = sleep(self.pacing.request_delay()) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }
                Err(err @ HarvestError::CircuitOpen { .. }) => {
                    // The upstream is unhealthy as a whole: back the
                    // partition off for the rest of the run.
                    stats.errors += 1;
                    break Err(err);
                }
                Err(HarvestError::Cancelled) => break Ok(()),
                Err(err) => {
                    stats.errors += 1;
                    if restarts >= self.restart_attempts {
                        break Err(err);
                    }
                    restarts += 1;
                    stats.worker_restarts = restarts;
                    warn!(partition = %self.partition.key, sequence, error = %err,
                          restart = restarts, max = self.restart_attempts,
                          "search failed, restarting worker");
                    worker.cleanup().await;
                    match self.spawn_worker(stats, &mut restarts).await {
                        Ok(replacement) => {
                            worker = replacement;
                            pending = Some(sequence);
                        }
                        Err(_) => break Err(err),
                    }
                }
            }
        };

        worker.cleanup().await;
        result
    }

    /// Create and initialize a worker, consuming restart budget on failure.
    async fn spawn_worker(
        &self,
        stats: &mut PartitionStats,
        restarts: &mut u32,
    ) -> Result<F::Worker> {
        loop {
            let mut worker = self.factory.create(&self.partition, &self.scan.year);
            if worker.initialize().await {
                return Ok(worker);
            }
            worker.cleanup().await;
            if *restarts >= self.restart_attempts {
                return Err(HarvestError::Authentication(format!(
                    "worker initialization failed after {} restarts",
                    *restarts
                )));
            }
            *restarts += 1;
            stats.worker_restarts = *restarts;
            warn!(partition = %self.partition.key, restart = *restarts,
                  max = self.restart_attempts, "retrying whole worker");
        }
    }

    /// Plan the partition's work from the store.
    async fn plan(&self) -> Result<Work> {
        let key = &self.partition.key;
        let year = &self.scan.year;
        match self.mode {
            RunMode::Parse => {
                let last = self.store.last_sequence_number(key, year).await?;
                let next = self.scan.start_from.unwrap_or(last + 1);
                info!(partition = %key, start = next, max = self.scan.max_number,
                      "forward scan planned");
                Ok(Work::Scan { next, empties: 0 })
            }
            RunMode::Gaps => {
                let existing = self.store.existing_sequence_numbers(key, year).await?;
                let last = self.store.last_sequence_number(key, year).await?;
                let gaps = gap_set(&existing, last);
                info!(partition = %key, gaps = gaps.len(), upper = last, "gap fill planned");
                Ok(Work::List(gaps.into_iter()))
            }
            RunMode::Update => {
                let existing = self.store.existing_sequence_numbers(key, year).await?;
                let numbers: Vec<u32> = existing.into_iter().collect();
                info!(partition = %key, cases = numbers.len(), "update replay planned");
                Ok(Work::List(numbers.into_iter()))
            }
        }
    }

    fn next_number(&self, work: &mut Work) -> Option<u32> {
        match work {
            Work::List(numbers) => numbers.next(),
            Work::Scan { next, empties } => {
                if *empties >= self.scan.max_consecutive_empty || *next > self.scan.max_number {
                    return None;
                }
                let sequence = *next;
                *next += 1;
                Some(sequence)
            }
        }
    }

    fn account(&self, outcome: SearchOutcome, work: &mut Work, stats: &mut PartitionStats) {
        match outcome {
            SearchOutcome::Saved { status, .. } => {
                match status {
                    SaveStatus::Saved => stats.saved += 1,
                    SaveStatus::Updated => stats.updated += 1,
                }
                if let Work::Scan { empties, .. } = work {
                    *empties = 0;
                }
            }
            SearchOutcome::TargetNotFound => {
                stats.not_found += 1;
                if let Work::Scan { empties, .. } = work {
                    *empties += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReporterConfig;
    use crate::report::TracingReporter;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scripted worker: fails the first N searches, then reports the
    /// scripted outcome for each sequence number.
    struct ScriptedWorker {
        log: Arc<StdMutex<Vec<u32>>>,
        failures_left: Arc<AtomicU32>,
        found: Vec<u32>,
        init_failures_left: Arc<AtomicU32>,
    }

    #[async_trait]
    impl PartitionWorker for ScriptedWorker {
        async fn initialize(&mut self) -> bool {
            self.init_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }

        async fn search_and_save(
            &mut self,
            sequence: u32,
            _style: QueryStyle,
        ) -> Result<SearchOutcome> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(HarvestError::Network("scripted failure".into()));
            }
            self.log.lock().unwrap().push(sequence);
            if self.found.contains(&sequence) {
                Ok(SearchOutcome::Saved {
                    case_number: format!("7194-25-00-4/{sequence}"),
                    status: SaveStatus::Saved,
                })
            } else {
                Ok(SearchOutcome::TargetNotFound)
            }
        }

        async fn cleanup(&mut self) {}
    }

    struct ScriptedFactory {
        log: Arc<StdMutex<Vec<u32>>>,
        failures: Arc<AtomicU32>,
        init_failures: Arc<AtomicU32>,
        found: Vec<u32>,
    }

    impl WorkerFactory for ScriptedFactory {
        type Worker = ScriptedWorker;

        fn create(&self, _partition: &Partition, _year: &str) -> ScriptedWorker {
            ScriptedWorker {
                log: Arc::clone(&self.log),
                failures_left: Arc::clone(&self.failures),
                found: self.found.clone(),
                init_failures_left: Arc::clone(&self.init_failures),
            }
        }
    }

    fn partition(key: &str) -> Partition {
        Partition {
            key: key.into(),
            name: key.into(),
            partition_code: "719".into(),
            instance_code: "4".into(),
            case_type_code: "4".into(),
            district_id: "12".into(),
            court_id: "7".into(),
        }
    }

    fn orchestrator(
        factory: ScriptedFactory,
        store: Arc<MemoryStore>,
        scan: ScanConfig,
        restart_attempts: u32,
    ) -> Orchestrator<ScriptedFactory> {
        Orchestrator::new(
            Arc::new(factory),
            store,
            Arc::new(TracingReporter::new(ReporterConfig::default())),
            vec![partition("central")],
            scan,
            PacingConfig {
                auth_step_delay_ms: 0,
                render_delay_ms: 0,
                request_delay_ms: 0,
            },
            ConcurrencyConfig {
                max_parallel_regions: 2,
                worker_restart_attempts: restart_attempts,
                max_reauth_attempts: 1,
                shutdown_grace_ms: 100,
            },
            CancellationToken::new(),
        )
    }

    fn scan_config(max_consecutive_empty: u32) -> ScanConfig {
        ScanConfig {
            year: "2025".into(),
            start_from: None,
            max_number: 9_999,
            max_consecutive_empty,
        }
    }

    #[tokio::test]
    async fn search_failure_restarts_worker_and_replays_number() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let factory = ScriptedFactory {
            log: Arc::clone(&log),
            failures: Arc::new(AtomicU32::new(1)),
            init_failures: Arc::new(AtomicU32::new(0)),
            found: vec![],
        };
        let store = Arc::new(MemoryStore::new());
        store.seed("central", "2025", &[1, 2]).await;

        let summary = orchestrator(factory, store, scan_config(2), 2)
            .run(RunMode::Parse)
            .await;

        // The failed first query (sequence 3) was replayed by the restarted
        // worker, then the scan ran until the empty bound.
        assert_eq!(*log.lock().unwrap(), vec![3, 4]);
        assert_eq!(summary.partitions[0].stats.worker_restarts, 1);
        assert!(!summary.partitions[0].failed);
    }

    #[tokio::test]
    async fn exhausted_restart_budget_marks_partition_failed() {
        let factory = ScriptedFactory {
            log: Arc::new(StdMutex::new(Vec::new())),
            failures: Arc::new(AtomicU32::new(100)),
            init_failures: Arc::new(AtomicU32::new(0)),
            found: vec![],
        };
        let store = Arc::new(MemoryStore::new());

        let summary = orchestrator(factory, store, scan_config(3), 1)
            .run(RunMode::Parse)
            .await;

        assert!(summary.partitions[0].failed);
        assert_eq!(summary.failed_partitions(), 1);
    }

    #[tokio::test]
    async fn initialization_failures_consume_restart_budget() {
        let factory = ScriptedFactory {
            log: Arc::new(StdMutex::new(Vec::new())),
            failures: Arc::new(AtomicU32::new(0)),
            init_failures: Arc::new(AtomicU32::new(10)),
            found: vec![],
        };
        let store = Arc::new(MemoryStore::new());

        let summary = orchestrator(factory, store, scan_config(3), 2)
            .run(RunMode::Parse)
            .await;

        assert!(summary.partitions[0].failed);
        assert_eq!(summary.partitions[0].stats.worker_restarts, 2);
    }

    #[tokio::test]
    async fn gaps_mode_replays_exactly_the_gap_set() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let factory = ScriptedFactory {
            log: Arc::clone(&log),
            failures: Arc::new(AtomicU32::new(0)),
            init_failures: Arc::new(AtomicU32::new(0)),
            found: vec![3],
        };
        let store = Arc::new(MemoryStore::new());
        store.seed("central", "2025", &[1, 2, 5, 7]).await;

        let summary = orchestrator(factory, store, scan_config(3), 1)
            .run(RunMode::Gaps)
            .await;

        assert_eq!(*log.lock().unwrap(), vec![3, 4, 6]);
        assert_eq!(summary.partitions[0].stats.saved, 1);
        assert_eq!(summary.partitions[0].stats.not_found, 2);
    }
}
