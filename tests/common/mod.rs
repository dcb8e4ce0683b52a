//! Shared test doubles: a scripted origin behind the worker seam.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use court_harvester::config::{ConcurrencyConfig, PacingConfig, ScanConfig};
use court_harvester::error::Result;
use court_harvester::identifier::Partition;
use court_harvester::orchestrator::Orchestrator;
use court_harvester::parse::Record;
use court_harvester::report::{ReporterConfig, TracingReporter};
use court_harvester::search::QueryStyle;
use court_harvester::store::{CaseStore, MemoryStore};
use court_harvester::worker::{PartitionWorker, SearchOutcome, WorkerFactory};

/// Every query the fake origin served: (partition, sequence, style).
#[derive(Default)]
pub struct QueryLog {
    pub entries: Mutex<Vec<(String, u32, QueryStyle)>>,
}

impl QueryLog {
    pub fn sequences_for(&self, partition: &str) -> Vec<u32> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _, _)| key == partition)
            .map(|(_, seq, _)| *seq)
            .collect()
    }

    pub fn styles(&self) -> Vec<QueryStyle> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, style)| *style)
            .collect()
    }
}

/// Worker that answers from a scripted set of sequence numbers the origin
/// "has", persisting matches like the production worker would. Session and
/// form-capability state is per-instance, mirroring the isolation contract.
pub struct FakeOriginWorker {
    partition: Partition,
    year: String,
    origin_numbers: Arc<Vec<u32>>,
    store: Arc<MemoryStore>,
    log: Arc<QueryLog>,
    violations: Arc<Mutex<Vec<String>>>,
    form_token: Option<String>,
}

impl FakeOriginWorker {
    fn expected_token(&self) -> String {
        format!("form-{}", self.partition.key)
    }
}

#[async_trait]
impl PartitionWorker for FakeOriginWorker {
    async fn initialize(&mut self) -> bool {
        self.form_token = Some(self.expected_token());
        true
    }

    async fn search_and_save(
        &mut self,
        sequence: u32,
        style: QueryStyle,
    ) -> Result<SearchOutcome> {
        match &self.form_token {
            Some(token) if *token == self.expected_token() => {}
            other => self.violations.lock().unwrap().push(format!(
                "worker {} observed foreign capability state: {other:?}",
                self.partition.key
            )),
        }

        self.log.entries.lock().unwrap().push((
            self.partition.key.clone(),
            sequence,
            style,
        ));

        if self.origin_numbers.contains(&sequence) {
            let record = Record {
                case_number: self.partition.render_case_number(&self.year, sequence),
                result_index: 0,
            };
            let status = self
                .store
                .save_record(&self.partition.key, &self.year, &record)
                .await?;
            Ok(SearchOutcome::Saved {
                case_number: record.case_number,
                status,
            })
        } else {
            Ok(SearchOutcome::TargetNotFound)
        }
    }

    async fn cleanup(&mut self) {
        self.form_token = None;
    }
}

pub struct FakeOriginFactory {
    pub origin_numbers: Arc<Vec<u32>>,
    pub store: Arc<MemoryStore>,
    pub log: Arc<QueryLog>,
    pub violations: Arc<Mutex<Vec<String>>>,
}

impl FakeOriginFactory {
    pub fn new(origin_numbers: Vec<u32>, store: Arc<MemoryStore>) -> Self {
        Self {
            origin_numbers: Arc::new(origin_numbers),
            store,
            log: Arc::new(QueryLog::default()),
            violations: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl WorkerFactory for FakeOriginFactory {
    type Worker = FakeOriginWorker;

    fn create(&self, partition: &Partition, year: &str) -> FakeOriginWorker {
        FakeOriginWorker {
            partition: partition.clone(),
            year: year.to_string(),
            origin_numbers: Arc::clone(&self.origin_numbers),
            store: Arc::clone(&self.store),
            log: Arc::clone(&self.log),
            violations: Arc::clone(&self.violations),
            form_token: None,
        }
    }
}

pub fn partition(key: &str, code: &str) -> Partition {
    Partition {
        key: key.to_string(),
        name: key.to_string(),
        partition_code: code.to_string(),
        instance_code: "4".to_string(),
        case_type_code: "4".to_string(),
        district_id: "12".to_string(),
        court_id: "7".to_string(),
    }
}

pub fn orchestrator(
    factory: FakeOriginFactory,
    store: Arc<MemoryStore>,
    partitions: Vec<Partition>,
    scan: ScanConfig,
) -> Orchestrator<FakeOriginFactory> {
    Orchestrator::new(
        Arc::new(factory),
        store as Arc<dyn CaseStore>,
        Arc::new(TracingReporter::new(ReporterConfig::default())),
        partitions,
        scan,
        PacingConfig {
            auth_step_delay_ms: 0,
            render_delay_ms: 0,
            request_delay_ms: 0,
        },
        ConcurrencyConfig {
            max_parallel_regions: 4,
            worker_restart_attempts: 1,
            max_reauth_attempts: 1,
            shutdown_grace_ms: 500,
        },
        CancellationToken::new(),
    )
}

pub fn scan_config(year: &str, max_consecutive_empty: u32, max_number: u32) -> ScanConfig {
    ScanConfig {
        year: year.to_string(),
        start_from: None,
        max_number,
        max_consecutive_empty,
    }
}
