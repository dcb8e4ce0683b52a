//! Per-partition workers.
//!
//! Each worker owns a fully isolated stack (session, authenticator, search
//! protocol, form cache) so concurrent partitions can never corrupt each
//! other's server-side form state. The orchestrator talks to workers
//! through the [`PartitionWorker`] trait and builds them through a
//! [`WorkerFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::AppConfig;
use crate::config::{AuthConfig, ConcurrencyConfig, OriginConfig, PacingConfig, RetrySettings};
use crate::error::{HarvestError, Result};
use crate::identifier::{matches_target, Partition};
use crate::parse::RecordParser;
use crate::resilience::{CircuitBreaker, RetryStrategy};
use crate::search::{QueryStyle, SearchForm, SearchProtocol};
use crate::session::SessionManager;
use crate::store::{CaseStore, SaveStatus};

/// Result of one search-and-save cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The target (or a duplicate-suffixed rendering of it) was found and
    /// upserted.
    Saved {
        case_number: String,
        status: SaveStatus,
    },
    /// The origin answered but no result matched the target. A legitimate
    /// outcome, not an error: the sequence is not dense.
    TargetNotFound,
}

/// One partition's worker as the orchestrator sees it.
#[async_trait]
pub trait PartitionWorker: Send {
    /// Build the session and authenticate. Returns `false` on failure so
    /// the orchestrator can retry the whole worker.
    async fn initialize(&mut self) -> bool;

    /// Search one sequence number and persist a matching result.
    async fn search_and_save(&mut self, sequence: u32, style: QueryStyle)
        -> Result<SearchOutcome>;

    /// Release the session. Must be called on every exit path.
    async fn cleanup(&mut self);
}

/// Builds workers bound to one partition and year.
pub trait WorkerFactory: Send + Sync {
    type Worker: PartitionWorker + 'static;

    fn create(&self, partition: &Partition, year: &str) -> Self::Worker;
}

/// Production worker driving the real protocol stack.
pub struct RegionWorker {
    partition: Partition,
    year: String,
    origin: OriginConfig,
    authenticator: Authenticator,
    protocol: SearchProtocol,
    parser: Arc<dyn RecordParser>,
    store: Arc<dyn CaseStore>,
    breaker: Arc<CircuitBreaker>,
    retries: RetrySettings,
    search_retry: RetryStrategy,
    max_reauth_attempts: u32,
    reauth_count: u32,
    session: Option<Mutex<SessionManager>>,
    form_cache: Mutex<Option<SearchForm>>,
}

impl RegionWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        partition: Partition,
        year: String,
        origin: OriginConfig,
        auth: AuthConfig,
        pacing: PacingConfig,
        retries: RetrySettings,
        breaker: Arc<CircuitBreaker>,
        parser: Arc<dyn RecordParser>,
        store: Arc<dyn CaseStore>,
        max_reauth_attempts: u32,
    ) -> Self {
        let authenticator = Authenticator::new(auth, pacing.clone(), retries.authentication.clone());
        let search_retry = RetryStrategy::new(retries.search.clone());
        Self {
            partition,
            year,
            origin,
            authenticator,
            protocol: SearchProtocol::new(pacing),
            parser,
            store,
            breaker,
            retries,
            search_retry,
            max_reauth_attempts,
            reauth_count: 0,
            session: None,
            form_cache: Mutex::new(None),
        }
    }

    async fn try_initialize(&mut self) -> Result<()> {
        let session = SessionManager::new(
            self.origin.clone(),
            self.retries.http.clone(),
            Arc::clone(&self.breaker),
        )?;
        self.session = Some(Mutex::new(session));
        self.reauth_count = 0;
        *self.form_cache.get_mut() = None;

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| HarvestError::Authentication("session not created".into()))?;
        self.authenticator.authenticate(session).await?;
        info!(partition = %self.partition.key, "worker authenticated");
        Ok(())
    }

    async fn attempt_search(&self, target: &str, style: QueryStyle) -> Result<SearchOutcome> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| HarvestError::Authentication("worker not initialized".into()))?;
        let mut session = session.lock().await;

        // The token is single-use and refreshed on every query; the form
        // identifiers are stable for the session and cached after the
        // first scrape.
        let (token, scraped_form) = self.protocol.prepare(&mut session).await?;
        let form = {
            let mut cache = self.form_cache.lock().await;
            match cache.as_ref() {
                Some(cached) => cached.clone(),
                None => {
                    *cache = Some(scraped_form.clone());
                    scraped_form
                }
            }
        };

        self.protocol
            .select_partition(&mut session, &token, &form, &self.partition)
            .await?;
        self.protocol.settle().await;

        let html = self
            .protocol
            .submit_query(
                &mut session,
                &token,
                &form,
                &self.partition,
                &self.year,
                target,
                style,
            )
            .await?;
        drop(session);

        let records = self.parser.parse(&html)?;
        let matched = records
            .iter()
            .find(|record| matches_target(target, &record.case_number));

        match matched {
            None => {
                debug!(target, results = records.len(), "target not found");
                Ok(SearchOutcome::TargetNotFound)
            }
            Some(record) => {
                let status = self
                    .store
                    .save_record(&self.partition.key, &self.year, record)
                    .await?;
                debug!(case = %record.case_number, ?status, "record persisted");
                Ok(SearchOutcome::Saved {
                    case_number: record.case_number.clone(),
                    status,
                })
            }
        }
    }

    /// Fresh transport, fresh login, dropped form cache. The re-rendered
    /// markup may carry different identifiers.
    async fn reauthenticate(&mut self) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| HarvestError::Authentication("worker not initialized".into()))?;
        *self.form_cache.lock().await = None;
        self.authenticator.authenticate(session).await
    }
}

#[async_trait]
impl PartitionWorker for RegionWorker {
    async fn initialize(&mut self) -> bool {
        match self.try_initialize().await {
            Ok(()) => true,
            Err(err) => {
                error!(partition = %self.partition.key, error = %err,
                       "worker initialization failed");
                false
            }
        }
    }

    async fn search_and_save(
        &mut self,
        sequence: u32,
        style: QueryStyle,
    ) -> Result<SearchOutcome> {
        let target = self.partition.render_case_number(&self.year, sequence);
        let context = format!("search {target}");

        let first = self
            .search_retry
            .execute(&context, || self.attempt_search(&target, style))
            .await;

        match first {
            Err(err)
                if err.status() == Some(401) && self.reauth_count < self.max_reauth_attempts =>
            {
                self.reauth_count += 1;
                warn!(partition = %self.partition.key, error = %err,
                      attempt = self.reauth_count, max = self.max_reauth_attempts,
                      "session rejected mid-search, re-authenticating");
                self.reauthenticate().await?;
                self.search_retry
                    .execute(&context, || self.attempt_search(&target, style))
                    .await
            }
            other => other,
        }
    }

    async fn cleanup(&mut self) {
        if let Some(session) = &self.session {
            session.lock().await.invalidate();
        }
        self.session = None;
        debug!(partition = %self.partition.key, "worker cleaned up");
    }
}

/// Builds production workers from the application configuration.
pub struct RegionWorkerFactory {
    origin: OriginConfig,
    auth: AuthConfig,
    pacing: PacingConfig,
    retries: RetrySettings,
    concurrency: ConcurrencyConfig,
    breaker: Arc<CircuitBreaker>,
    parser: Arc<dyn RecordParser>,
    store: Arc<dyn CaseStore>,
}

impl RegionWorkerFactory {
    pub fn new(
        config: &AppConfig,
        breaker: Arc<CircuitBreaker>,
        parser: Arc<dyn RecordParser>,
        store: Arc<dyn CaseStore>,
    ) -> Self {
        Self {
            origin: config.origin.clone(),
            auth: config.auth.clone(),
            pacing: config.pacing.clone(),
            retries: config.retry.clone(),
            concurrency: config.concurrency.clone(),
            breaker,
            parser,
            store,
        }
    }
}

impl WorkerFactory for RegionWorkerFactory {
    type Worker = RegionWorker;

    fn create(&self, partition: &Partition, year: &str) -> RegionWorker {
        RegionWorker::new(
            partition.clone(),
            year.to_string(),
            self.origin.clone(),
            self.auth.clone(),
            self.pacing.clone(),
            self.retries.clone(),
            Arc::clone(&self.breaker),
            Arc::clone(&self.parser),
            Arc::clone(&self.store),
            self.concurrency.max_reauth_attempts,
        )
    }
}
