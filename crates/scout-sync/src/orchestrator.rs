//! Bounded concurrent fan-out over the configured source adapters.

use std::sync::Arc;
use std::time::Duration;

use scout_adapters::{AdapterError, SourceAdapter};
use scout_core::{CandidateRecord, SyncScope};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{info, warn};

pub const PROGRESS_STARTED: f64 = 0.1;
pub const PROGRESS_FETCH_SPAN: f64 = 0.6;
pub const PROGRESS_MERGING: f64 = 0.7;
pub const PROGRESS_PERSISTING: f64 = 0.9;
pub const PROGRESS_DONE: f64 = 1.0;

#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error("{source_id}: timed out after {timeout:?}")]
    TimedOut { source_id: String, timeout: Duration },
    #[error("{source_id}: {error}")]
    Adapter {
        source_id: String,
        #[source]
        error: AdapterError,
    },
    #[error("{source_id}: fetch task aborted: {message}")]
    Aborted { source_id: String, message: String },
}

impl SourceFetchError {
    pub fn source_id(&self) -> &str {
        match self {
            SourceFetchError::TimedOut { source_id, .. }
            | SourceFetchError::Adapter { source_id, .. }
            | SourceFetchError::Aborted { source_id, .. } => source_id,
        }
    }
}

/// The single terminal outcome of one adapter for one sync.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    pub result: Result<Vec<CandidateRecord>, SourceFetchError>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_parallelism: usize,
    /// Ceiling on one adapter's whole fetch, on top of the per-request HTTP timeout.
    pub source_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 3,
            source_timeout: Duration::from_secs(120),
        }
    }
}

/// Forwards progress to a caller callback, clamped to `[0, 1]` and never moving backwards.
pub struct ProgressReporter<'a> {
    callback: &'a mut (dyn FnMut(f64, &str) + Send),
    last: f64,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(callback: &'a mut (dyn FnMut(f64, &str) + Send)) -> Self {
        Self {
            callback,
            last: 0.0,
        }
    }

    pub fn report(&mut self, fraction: f64, message: &str) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0).max(self.last)
        } else {
            self.last
        };
        self.last = fraction;
        (self.callback)(fraction, message);
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

pub struct FetchOrchestrator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    config: OrchestratorConfig,
}

impl FetchOrchestrator {
    pub fn new(adapters: Vec<Arc<dyn SourceAdapter>>, config: OrchestratorConfig) -> Self {
        Self { adapters, config }
    }

    /// Source ids in configured order; this is also the merge fold order.
    pub fn source_ids(&self) -> Vec<String> {
        self.adapters
            .iter()
            .map(|a| a.source_id().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Run every adapter for `scope` and return one outcome per adapter in configured order.
    ///
    /// Returns only after every adapter has finished, failed, or hit its timeout.
    pub async fn fetch_all(
        &self,
        scope: &SyncScope,
        progress: &mut ProgressReporter<'_>,
    ) -> Vec<SourceOutcome> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallelism.max(1)));
        let source_timeout = self.config.source_timeout;

        let handles = self
            .adapters
            .iter()
            .map(|adapter| {
                let adapter = Arc::clone(adapter);
                let permits = Arc::clone(&permits);
                let scope = scope.clone();
                let source_id = adapter.source_id().to_string();
                let handle = tokio::spawn(async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(err) => {
                            return Err(SourceFetchError::Aborted {
                                source_id: adapter.source_id().to_string(),
                                message: err.to_string(),
                            })
                        }
                    };
                    match timeout(source_timeout, adapter.fetch(&scope)).await {
                        Ok(Ok(records)) => Ok(records),
                        Ok(Err(error)) => Err(SourceFetchError::Adapter {
                            source_id: adapter.source_id().to_string(),
                            error,
                        }),
                        Err(_) => Err(SourceFetchError::TimedOut {
                            source_id: adapter.source_id().to_string(),
                            timeout: source_timeout,
                        }),
                    }
                });
                (source_id, handle)
            })
            .collect::<Vec<_>>();

        let total = handles.len().max(1) as f64;
        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, (source_id, handle)) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(SourceFetchError::Aborted {
                    source_id: source_id.clone(),
                    message: join_err.to_string(),
                }),
            };
            match &result {
                Ok(records) => {
                    info!(source_id = %source_id, league = %scope, records = records.len(), "source fetched")
                }
                Err(err) => warn!(source_id = %source_id, league = %scope, error = %err, "source failed"),
            }
            progress.report(
                PROGRESS_STARTED + PROGRESS_FETCH_SPAN * (index + 1) as f64 / total,
                &format!("Fetched {source_id} data"),
            );
            outcomes.push(SourceOutcome { source_id, result });
        }
        outcomes
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::testing::FakeAdapter;
    use super::*;

    async fn run(orchestrator: &FetchOrchestrator) -> (Vec<SourceOutcome>, Vec<f64>) {
        let mut seen = Vec::new();
        let mut callback = |fraction: f64, _message: &str| seen.push(fraction);
        let mut progress = ProgressReporter::new(&mut callback);
        let outcomes = orchestrator
            .fetch_all(&SyncScope::new("MLS"), &mut progress)
            .await;
        (outcomes, seen)
    }

    #[tokio::test]
    async fn failing_source_is_isolated() {
        let orchestrator = FetchOrchestrator::new(
            vec![
                FakeAdapter::ok("fbref").player("John Smith", "FC X", &[]).into_arc(),
                FakeAdapter::failing("transfermarkt", "blocked").into_arc(),
                FakeAdapter::ok("sofascore").player("John Smith", "FC X", &[]).into_arc(),
            ],
            OrchestratorConfig::default(),
        );
        let (outcomes, _) = run(&orchestrator).await;

        assert_eq!(
            outcomes.iter().map(|o| o.source_id.as_str()).collect::<Vec<_>>(),
            vec!["fbref", "transfermarkt", "sofascore"]
        );
        assert_eq!(outcomes[0].result.as_ref().unwrap().len(), 1);
        let err = outcomes[1].result.as_ref().unwrap_err();
        assert_eq!(err.source_id(), "transfermarkt");
        assert!(err.to_string().contains("blocked"));
        assert_eq!(outcomes[2].result.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_source_becomes_timeout_failure() {
        let orchestrator = FetchOrchestrator::new(
            vec![
                FakeAdapter::ok("fast").player("A B", "C", &[]).into_arc(),
                FakeAdapter::ok("slow")
                    .player("A B", "C", &[])
                    .delayed(Duration::from_secs(5))
                    .into_arc(),
            ],
            OrchestratorConfig {
                max_parallelism: 2,
                source_timeout: Duration::from_millis(50),
            },
        );
        let (outcomes, _) = run(&orchestrator).await;

        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(SourceFetchError::TimedOut { ref source_id, .. }) if source_id == "slow"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn parallelism_cap_is_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let adapters = (0..6)
            .map(|i| {
                let mut adapter = FakeAdapter::ok(&format!("s{i}")).delayed(Duration::from_millis(20));
                adapter.in_flight = Some(Arc::clone(&in_flight));
                adapter.peak = Some(Arc::clone(&peak));
                adapter.into_arc()
            })
            .collect();
        let orchestrator = FetchOrchestrator::new(
            adapters,
            OrchestratorConfig {
                max_parallelism: 2,
                source_timeout: Duration::from_secs(5),
            },
        );
        let (outcomes, _) = run(&orchestrator).await;

        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    fn slow_adapters(count: usize, delay: Duration) -> Vec<Arc<dyn SourceAdapter>> {
        (0..count)
            .map(|i| FakeAdapter::ok(&format!("s{i}")).delayed(delay).into_arc())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_tracks_slowest_source_not_the_sum() {
        let orchestrator = FetchOrchestrator::new(
            slow_adapters(4, Duration::from_secs(1)),
            OrchestratorConfig {
                max_parallelism: 4,
                source_timeout: Duration::from_secs(30),
            },
        );
        let started = tokio::time::Instant::now();
        let (outcomes, _) = run(&orchestrator).await;
        let elapsed = started.elapsed();

        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn capped_fetch_runs_in_waves() {
        let orchestrator = FetchOrchestrator::new(
            slow_adapters(4, Duration::from_secs(1)),
            OrchestratorConfig {
                max_parallelism: 2,
                source_timeout: Duration::from_secs(30),
            },
        );
        let started = tokio::time::Instant::now();
        run(&orchestrator).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn progress_is_reported_per_source_in_order() {
        let orchestrator = FetchOrchestrator::new(
            vec![
                FakeAdapter::ok("a").delayed(Duration::from_millis(30)).into_arc(),
                FakeAdapter::ok("b").into_arc(),
            ],
            OrchestratorConfig::default(),
        );
        let (_, seen) = run(&orchestrator).await;

        assert_eq!(seen.len(), 2);
        assert!((seen[0] - 0.4).abs() < 1e-9);
        assert!((seen[1] - PROGRESS_MERGING).abs() < 1e-9);
    }

    #[test]
    fn reporter_clamps_and_never_regresses() {
        let mut seen = Vec::new();
        let mut callback = |fraction: f64, _message: &str| seen.push(fraction);
        let mut progress = ProgressReporter::new(&mut callback);
        progress.report(0.5, "half");
        progress.report(0.2, "stale");
        progress.report(3.0, "overshoot");
        progress.report(f64::NAN, "nan");
        assert_eq!(progress.last(), 1.0);
        assert_eq!(seen, vec![0.5, 0.5, 1.0, 1.0]);
    }
}
