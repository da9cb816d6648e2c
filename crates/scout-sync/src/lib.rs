//! Sync pipeline: fetch every source, cluster, merge, persist, record.

pub mod export;
pub mod ledger;
pub mod merge;
pub mod orchestrator;
pub mod persistence;
pub mod resolver;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use scout_adapters::{build_adapter, SourceAdapter, SourceConfig};
use scout_core::{SyncOutcome, SyncScope, SyncStatus};
use scout_storage::{HttpClientConfig, HttpFetcher, PacingConfig, ResponseCache};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use export::{export_snapshot, SnapshotManifest};
pub use ledger::{LedgerError, MemoryLedger, PgLedger, SyncLedger};
pub use merge::merge_cluster;
pub use orchestrator::{
    FetchOrchestrator, OrchestratorConfig, ProgressReporter, SourceFetchError, SourceOutcome,
    PROGRESS_DONE, PROGRESS_MERGING, PROGRESS_PERSISTING, PROGRESS_STARTED,
};
pub use persistence::{MemoryGateway, PersistenceError, PersistenceGateway, PgGateway};
pub use resolver::{match_key, resolve, Cluster};

pub const CRATE_NAME: &str = "scout-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Unset means in-memory persistence and ledger.
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub rate_limit_delay: Duration,
    pub cache_ttl: Duration,
    pub source_timeout: Duration,
    pub export_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub cache_sweep_cron: String,
    pub leagues: Vec<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("SCOUT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_url: env_nonempty("DATABASE_URL"),
            sources_file: std::env::var("SCOUT_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            user_agent: std::env::var("SCOUT_USER_AGENT")
                .unwrap_or_else(|_| format!("scout-bot/{}", env!("CARGO_PKG_VERSION"))),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECONDS", 30)),
            max_concurrent_requests: env_parse("MAX_CONCURRENT_REQUESTS", 3),
            rate_limit_delay: Duration::from_secs_f64(
                env_parse("RATE_LIMIT_DELAY_SECONDS", 2.0_f64).max(0.0),
            ),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_HOURS", 6u64) * 3600),
            source_timeout: Duration::from_secs(env_parse("SOURCE_TIMEOUT_SECONDS", 120)),
            export_path: env_nonempty("EXPORT_PATH").map(PathBuf::from),
            scheduler_enabled: std::env::var("SCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            cache_sweep_cron: std::env::var("CACHE_SWEEP_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            leagues: parse_leagues(&std::env::var("SCOUT_LEAGUES").unwrap_or_default()),
            workspace_root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join(&self.sources_file)
    }

    pub fn fixtures_root(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.request_timeout,
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.max_concurrent_requests,
            pacing: PacingConfig::fixed_delay(self.rate_limit_delay),
            cache_ttl: self.cache_ttl,
            ..Default::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_parallelism: self.max_concurrent_requests,
            source_timeout: self.source_timeout,
        }
    }
}

/// Comma-separated league list; empty input yields `MLS`.
pub fn parse_leagues(raw: &str) -> Vec<String> {
    let leagues = raw
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if leagues.is_empty() {
        vec!["MLS".to_string()]
    } else {
        leagues
    }
}

/// Instantiate adapters for enabled sources, in registry order.
///
/// `credential_for` resolves an `api_key_env` name; a source whose key cannot be
/// resolved is skipped rather than failing every sync.
pub fn build_adapters(
    registry: &SourceRegistry,
    http: Arc<HttpFetcher>,
    fixtures_root: &Path,
    credential_for: impl Fn(&str) -> Option<String>,
) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let mut adapters = Vec::new();
    for source in registry.sources.iter().filter(|s| s.enabled) {
        let credential = match &source.api_key_env {
            Some(var) => match credential_for(var) {
                Some(key) => Some(key),
                None => {
                    warn!(source_id = %source.source_id, env = %var, "credential not configured; skipping source");
                    continue;
                }
            },
            None => None,
        };
        let adapter = build_adapter(source, credential, Arc::clone(&http), fixtures_root)
            .with_context(|| format!("building adapter for {}", source.source_id))?;
        debug!(source_id = %source.source_id, kind = ?adapter.kind(), "adapter ready");
        adapters.push(adapter);
    }
    Ok(adapters)
}

pub async fn connect_database(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")
}

pub struct SyncPipeline {
    orchestrator: FetchOrchestrator,
    gateway: Arc<dyn PersistenceGateway>,
    ledger: Arc<dyn SyncLedger>,
    cache: Arc<ResponseCache>,
    export_dir: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        orchestrator: FetchOrchestrator,
        gateway: Arc<dyn PersistenceGateway>,
        ledger: Arc<dyn SyncLedger>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            orchestrator,
            gateway,
            ledger,
            cache,
            export_dir: None,
        }
    }

    pub fn with_export_dir(mut self, export_dir: Option<PathBuf>) -> Self {
        self.export_dir = export_dir;
        self
    }

    /// Wire adapters, HTTP client, cache and storage from `config`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let cache = Arc::new(ResponseCache::new());
        let http = Arc::new(HttpFetcher::new(config.http_client_config(), Arc::clone(&cache))?);
        let registry = SourceRegistry::load(&config.sources_path()).await?;
        let adapters = build_adapters(&registry, http, &config.fixtures_root(), env_nonempty)?;

        let (gateway, ledger): (Arc<dyn PersistenceGateway>, Arc<dyn SyncLedger>) =
            match &config.database_url {
                Some(url) => {
                    let pool = connect_database(url).await?;
                    (
                        Arc::new(PgGateway::new(pool.clone())),
                        Arc::new(PgLedger::new(pool)),
                    )
                }
                None => {
                    warn!("DATABASE_URL not set; records and sync history are kept in memory");
                    (Arc::new(MemoryGateway::new()), Arc::new(MemoryLedger::new()))
                }
            };

        Ok(Self::new(
            FetchOrchestrator::new(adapters, config.orchestrator_config()),
            gateway,
            ledger,
            cache,
        )
        .with_export_dir(config.export_path.clone()))
    }

    pub fn ledger(&self) -> &Arc<dyn SyncLedger> {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Drop expired cache entries; returns how many were removed.
    pub async fn sweep_cache(&self) -> usize {
        self.cache.sweep().await
    }

    /// Run one sync for `scope`. Always yields an outcome; fatal errors mark it `failed`.
    pub async fn run(
        &self,
        scope: &SyncScope,
        progress: &mut (dyn FnMut(f64, &str) + Send),
    ) -> SyncOutcome {
        let span = info_span!("sync", league = %scope);
        self.run_inner(scope, progress).instrument(span).await
    }

    async fn run_inner(
        &self,
        scope: &SyncScope,
        progress: &mut (dyn FnMut(f64, &str) + Send),
    ) -> SyncOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut progress = ProgressReporter::new(progress);
        progress.report(PROGRESS_STARTED, &format!("Starting sync for {scope}"));

        let mut outcome = SyncOutcome {
            sync_id: None,
            league: scope.league.clone(),
            status: SyncStatus::Started,
            started_at,
            completed_at: started_at,
            duration_seconds: 0.0,
            per_source_counts: Default::default(),
            total_canonical_records: 0,
            persisted_records: 0,
            persistence_failures: 0,
            errors: Vec::new(),
        };

        match self.execute(scope, &mut progress, &mut outcome).await {
            Ok(()) => {
                outcome.status = SyncStatus::Completed;
                info!(
                    records = outcome.persisted_records,
                    failures = outcome.persistence_failures,
                    source_errors = outcome.errors.len(),
                    "sync completed"
                );
                progress.report(
                    PROGRESS_DONE,
                    &format!("Sync completed! {} players updated", outcome.persisted_records),
                );
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "sync failed");
                outcome.status = SyncStatus::Failed;
                outcome.errors.push(format!("sync failed: {message}"));
                if let Some(id) = outcome.sync_id {
                    if let Err(ledger_err) = self
                        .ledger
                        .append_outcome(id, SyncStatus::Failed, outcome.persisted_records, Some(&message))
                        .await
                    {
                        error!(sync_id = %id, error = %ledger_err, "could not record failed sync");
                    }
                }
                progress.report(PROGRESS_DONE, &format!("Sync failed: {message}"));
            }
        }

        outcome.completed_at = Utc::now();
        outcome.duration_seconds = clock.elapsed().as_secs_f64();
        outcome
    }

    async fn execute(
        &self,
        scope: &SyncScope,
        progress: &mut ProgressReporter<'_>,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        let source_scope = self.orchestrator.source_ids().join(",");
        let sync_id = self
            .ledger
            .append_start(&scope.league, &source_scope)
            .await
            .context("opening sync ledger record")?;
        outcome.sync_id = Some(sync_id);

        if self.orchestrator.is_empty() {
            bail!("no source adapters configured");
        }

        let mut candidates = Vec::new();
        for source in self.orchestrator.fetch_all(scope, progress).await {
            match source.result {
                Ok(records) => {
                    outcome.per_source_counts.insert(source.source_id, records.len());
                    candidates.extend(records);
                }
                Err(err) => outcome.errors.push(err.to_string()),
            }
        }

        progress.report(PROGRESS_MERGING, "Merging data from all sources");
        let merged_at = Utc::now();
        let records = resolve(candidates)
            .values()
            .map(|cluster| merge_cluster(cluster, &scope.league, merged_at))
            .collect::<Vec<_>>();
        outcome.total_canonical_records = records.len();

        progress.report(PROGRESS_PERSISTING, "Saving to database");
        for record in &records {
            match self.gateway.upsert(record).await {
                Ok(()) => outcome.persisted_records += 1,
                Err(err) => {
                    outcome.persistence_failures += 1;
                    error!(record_id = %record.id, name = %record.name, error = %err, "upsert failed");
                }
            }
        }

        if let Some(export_dir) = &self.export_dir {
            if let Err(err) = export_snapshot(export_dir, scope, &sync_id.to_string(), &records).await {
                warn!(error = %format!("{err:#}"), "snapshot export failed");
                outcome.errors.push(format!("snapshot export failed: {err:#}"));
            }
        }

        self.ledger
            .append_outcome(sync_id, SyncStatus::Completed, outcome.persisted_records, None)
            .await
            .context("closing sync ledger record")?;
        Ok(())
    }

    /// Sync each league in order.
    pub async fn run_all(
        &self,
        leagues: &[String],
        progress: &mut (dyn FnMut(f64, &str) + Send),
    ) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::with_capacity(leagues.len());
        for league in leagues {
            outcomes.push(self.run(&SyncScope::new(league.clone()), progress).await);
        }
        outcomes
    }
}

/// Cron jobs for every configured league plus the cache sweep, when enabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    for league in &config.leagues {
        let pipeline = Arc::clone(&pipeline);
        let league = league.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let scope = SyncScope::new(league.clone());
            Box::pin(async move {
                let mut log_progress =
                    |fraction: f64, message: &str| debug!(fraction, step = message, "sync progress");
                let outcome = pipeline.run(&scope, &mut log_progress).await;
                info!(
                    league = %outcome.league,
                    status = %outcome.status,
                    records = outcome.persisted_records,
                    "scheduled sync finished"
                );
            })
        })
        .with_context(|| format!("creating sync job for cron {cron}"))?;
        sched.add(job).await.context("adding sync job")?;
    }

    let cron = &config.cache_sweep_cron;
    let sweeper = Arc::clone(&pipeline);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&sweeper);
        Box::pin(async move {
            pipeline.sweep_cache().await;
        })
    })
    .with_context(|| format!("creating cache sweep job for cron {cron}"))?;
    sched.add(job).await.context("adding cache sweep job")?;

    Ok(Some(sched))
}

pub async fn run_sync_once_from_env(league: &str) -> Result<SyncOutcome> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config).await?;
    let mut log_progress = |fraction: f64, message: &str| info!(fraction, step = message, "sync progress");
    Ok(pipeline.run(&SyncScope::new(league), &mut log_progress).await)
}
