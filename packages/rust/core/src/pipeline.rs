//! End-to-end audit pipeline: crawl → cache junction → rank → parallel
//! analyses → action plan → summary.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, instrument};

use seoscope_cache::{ResultCache, extract_domain};
use seoscope_shared::{CachedFindings, PipelineConfig, Result, RunId, SeoscopeError};

use crate::collaborators::{AnalysisInputs, AnalysisProgress, AnalysisProvider, Collaborators, CrawlProgress};
use crate::run::{FailureKind, Partial, RunFailure, RunHandle, RunSnapshot, RunState, Severity};
use crate::stage::{StageId, StageProgress, StageStatus};

/// A request to audit one site.
#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub seed_url: String,
    /// Opaque analysis configuration handed to every provider.
    pub config: Value,
}

impl AuditRequest {
    pub fn new(seed_url: impl Into<String>) -> Self {
        Self {
            seed_url: seed_url.into(),
            config: json!({}),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Sequences the collaborators for each submitted run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    collaborators: Collaborators,
    cache: ResultCache,
    config: PipelineConfig,
}

/// Why `execute` stopped, before it becomes a [`RunFailure`].
#[derive(Debug)]
struct StageFailure {
    stage: Option<StageId>,
    error: SeoscopeError,
}

impl StageFailure {
    fn at(stage: StageId, error: SeoscopeError) -> Self {
        Self {
            stage: Some(stage),
            error,
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.error, SeoscopeError::Cancelled)
    }

    fn into_run_failure(self) -> RunFailure {
        let kind = match &self.error {
            SeoscopeError::Cancelled => FailureKind::Cancelled,
            SeoscopeError::Input { .. } => FailureKind::Input,
            _ => FailureKind::Collaborator,
        };
        let message = match self.error {
            SeoscopeError::Collaborator { message, .. } | SeoscopeError::Input { message } => message,
            other => other.to_string(),
        };
        RunFailure {
            kind,
            stage: self.stage,
            message,
        }
    }
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, cache: ResultCache, config: PipelineConfig) -> Self {
        Self {
            collaborators,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Start a run in the background and return a handle to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, request: AuditRequest) -> Result<RunHandle> {
        let seed_url = request.seed_url.trim().to_string();
        if seed_url.is_empty() {
            return Err(SeoscopeError::input("seed URL is empty"));
        }
        let request = AuditRequest { seed_url, ..request };

        let id = RunId::new();
        let (state, rx) = RunState::new(RunSnapshot::new(id, &request.seed_url, Utc::now()));
        let cancel = CancellationToken::new();
        let span = info_span!("audit_run", run_id = %id, seed_url = %request.seed_url);

        let state = Arc::new(state);
        let worker = tokio::spawn(
            self.clone()
                .drive(state.clone(), request, cancel.clone())
                .instrument(span),
        );
        // Settles the run if the driver panics.
        let task = tokio::spawn(async move {
            if let Err(e) = worker.await {
                state.abort_unexpected(panic_message(e));
            }
        });

        Ok(RunHandle::new(id, rx, cancel, task))
    }

    /// Submit a run and wait for it to finish.
    pub async fn run(&self, request: AuditRequest) -> Result<RunSnapshot> {
        Ok(self.submit(request)?.wait().await)
    }

    /// Cancel an in-flight run. Same as [`RunHandle::cancel`].
    pub fn cancel(&self, handle: &RunHandle) {
        handle.cancel();
    }

    // -----------------------------------------------------------------------
    // Run driver
    // -----------------------------------------------------------------------

    async fn drive(self, state: Arc<RunState>, request: AuditRequest, cancel: CancellationToken) {
        state.log(
            Severity::Info,
            None,
            format!("Starting analysis of {}", request.seed_url),
        );
        match self.execute(&state, &request, &cancel).await {
            Ok(()) => state.finish(),
            Err(failure) => state.abort(failure.into_run_failure()),
        }
    }

    async fn execute(
        &self,
        state: &RunState,
        request: &AuditRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), StageFailure> {
        let discovered = self.crawl(state, request, cancel).await?;

        state.log(Severity::Annotation, None, "Checking result cache");
        // Not raced against cancellation: a self-heal must finish once begun.
        let cached = self.cache.lookup(&request.seed_url, discovered.as_slice()).await;
        if cancel.is_cancelled() {
            return Err(StageFailure {
                stage: None,
                error: SeoscopeError::Cancelled,
            });
        }
        state.set_cache_hit(cached.is_some());

        let (analyzed, findings) = match cached {
            Some(findings) => (self.replay(state, &discovered), findings),
            None => self.analyze(state, request, &discovered, cancel).await?,
        };
        state.record(Partial::SiteWide(findings.site_wide.clone()));
        state.record(Partial::PerPage(findings.per_page.clone()));

        let mut inputs = AnalysisInputs {
            seed_url: request.seed_url.clone(),
            domain: extract_domain(&request.seed_url),
            urls: analyzed,
            site_wide: Some(findings.site_wide),
            per_page: Some(findings.per_page),
            action_plan: None,
        };

        let plan = self
            .run_step(
                state,
                StageId::ActionPlan,
                self.collaborators.action_plan.as_ref(),
                &request.config,
                &inputs,
                cancel,
            )
            .await
            .map_err(|e| StageFailure::at(StageId::ActionPlan, e))?;
        state.record(Partial::ActionPlan(plan.clone()));
        inputs.action_plan = Some(plan);

        let summary = self
            .run_step(
                state,
                StageId::Summary,
                self.collaborators.summary.as_ref(),
                &request.config,
                &inputs,
                cancel,
            )
            .await
            .map_err(|e| StageFailure::at(StageId::Summary, e))?;
        state.record(Partial::Summary(summary));

        Ok(())
    }

    async fn crawl(
        &self,
        state: &RunState,
        request: &AuditRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<String>, StageFailure> {
        state.start_stage(StageId::Crawl);
        let sink = StageSink {
            state,
            stage: StageId::Crawl,
        };
        let urls = guarded(cancel, self.collaborators.crawler.crawl(&request.seed_url, &sink))
            .await
            .map_err(|e| StageFailure::at(StageId::Crawl, e))?;

        let reported = urls.len();
        let mut seen = HashSet::with_capacity(reported);
        let urls: Vec<String> = urls.into_iter().filter(|url| seen.insert(url.clone())).collect();
        if urls.len() < reported {
            state.log(
                Severity::Warning,
                Some(StageId::Crawl),
                format!("Dropped {} duplicate URLs", reported - urls.len()),
            );
        }

        if urls.is_empty() {
            return Err(StageFailure::at(
                StageId::Crawl,
                SeoscopeError::input(format!("no URLs discovered for {}", request.seed_url)),
            ));
        }

        state.observe(
            StageId::Crawl,
            StageProgress {
                items_processed: Some(urls.len()),
                total_items: Some(urls.len()),
                ..Default::default()
            },
        );
        state.record(Partial::DiscoveredCount(urls.len()));
        state.log(
            Severity::Info,
            Some(StageId::Crawl),
            format!("Discovered {} URLs", urls.len()),
        );
        state.complete_stage(StageId::Crawl);
        Ok(urls)
    }

    /// Cache hit: mark the cacheable stages skipped without calling anything.
    fn replay(&self, state: &RunState, discovered: &[String]) -> Vec<String> {
        state.log(
            Severity::Success,
            None,
            "Cache hit, reusing stored analysis for this URL set",
        );
        for id in StageId::CACHEABLE {
            state.skip_stage(id);
        }
        let analyzed: Vec<String> = discovered
            .iter()
            .take(self.config.max_analyzed_urls)
            .cloned()
            .collect();
        state.record(Partial::AnalyzedCount(analyzed.len()));
        analyzed
    }

    /// Cache miss: rank, run the three analyses concurrently, store the result.
    #[instrument(skip_all, fields(discovered = discovered.len()))]
    async fn analyze(
        &self,
        state: &RunState,
        request: &AuditRequest,
        discovered: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<(Vec<String>, CachedFindings), StageFailure> {
        let ranked = self.rank(state, discovered, cancel)?;
        let inputs = AnalysisInputs {
            seed_url: request.seed_url.clone(),
            domain: extract_domain(&request.seed_url),
            urls: ranked.clone(),
            ..Default::default()
        };

        // Siblings share a group token so one failure stops the other two.
        let group = cancel.child_token();
        let c = &self.collaborators;
        let (competitor, technical, content) = tokio::join!(
            self.fan_out_step(state, StageId::Competitor, c.competitor.as_ref(), Partial::Competitor, request, &inputs, &group),
            self.fan_out_step(state, StageId::Technical, c.technical.as_ref(), Partial::Technical, request, &inputs, &group),
            self.fan_out_step(state, StageId::Content, c.content.as_ref(), Partial::Content, request, &inputs, &group),
        );

        let (competitor, technical, content) = match (competitor, technical, content) {
            (Ok(a), Ok(b), Ok(c)) => (a, b, c),
            (a, b, c) => return Err(root_failure([a.err(), b.err(), c.err()].into_iter().flatten())),
        };

        let findings = CachedFindings {
            site_wide: json!({ "competitor": competitor, "technical": technical }),
            per_page: content,
        };
        self.cache
            .store(&request.seed_url, discovered, findings.clone(), None)
            .await;
        state.log(Severity::Annotation, None, "Stored analysis in result cache");

        Ok((ranked, findings))
    }

    fn rank(
        &self,
        state: &RunState,
        discovered: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<String>, StageFailure> {
        if cancel.is_cancelled() {
            return Err(StageFailure {
                stage: None,
                error: SeoscopeError::Cancelled,
            });
        }
        state.start_stage(StageId::Rank);
        let mut ranked = self.collaborators.ranker.rank(discovered);
        let total = ranked.len();
        ranked.truncate(self.config.max_analyzed_urls);

        state.observe(
            StageId::Rank,
            StageProgress {
                items_processed: Some(ranked.len()),
                total_items: Some(total),
                ..Default::default()
            },
        );
        state.record(Partial::AnalyzedCount(ranked.len()));
        state.log(
            Severity::Info,
            Some(StageId::Rank),
            format!("Selected top {} of {total} URLs", ranked.len()),
        );
        state.complete_stage(StageId::Rank);
        Ok(ranked)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fan_out_step(
        &self,
        state: &RunState,
        id: StageId,
        provider: &dyn AnalysisProvider,
        slot: fn(Value) -> Partial,
        request: &AuditRequest,
        inputs: &AnalysisInputs,
        group: &CancellationToken,
    ) -> std::result::Result<Value, StageFailure> {
        match self.run_step(state, id, provider, &request.config, inputs, group).await {
            Ok(value) => {
                state.record(slot(value.clone()));
                Ok(value)
            }
            Err(error) => {
                if !matches!(error, SeoscopeError::Cancelled) {
                    group.cancel();
                }
                Err(StageFailure::at(id, error))
            }
        }
    }

    /// Run one provider as stage `id`. On error the stage is left running
    /// for `RunState::abort` to settle.
    async fn run_step(
        &self,
        state: &RunState,
        id: StageId,
        provider: &dyn AnalysisProvider,
        config: &Value,
        inputs: &AnalysisInputs,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        state.start_stage(id);
        let sink = StageSink { state, stage: id };
        let value = guarded(cancel, provider.run(config, inputs, &sink)).await?;
        state.complete_stage(id);
        Ok(value)
    }
}

/// Race `work` against cancellation.
async fn guarded<T>(cancel: &CancellationToken, work: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SeoscopeError::Cancelled),
        result = work => result,
    }
}

/// Readable cause of a run task that ended without settling its state.
fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return format!("run task ended abnormally: {error}");
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("internal error: {detail}")
}

/// The failure that caused a fan-out to stop: the first real error, or a
/// cancellation when every branch was cancelled.
fn root_failure(failures: impl Iterator<Item = StageFailure>) -> StageFailure {
    let mut cancelled = None;
    for failure in failures {
        if !failure.is_cancelled() {
            return failure;
        }
        cancelled.get_or_insert(failure);
    }
    cancelled.unwrap_or(StageFailure {
        stage: None,
        error: SeoscopeError::Cancelled,
    })
}

/// Progress sink handed to a collaborator for one stage.
struct StageSink<'a> {
    state: &'a RunState,
    stage: StageId,
}

impl CrawlProgress for StageSink<'_> {
    fn report(&self, count: usize, total: usize, label: &str) {
        let progress = if total > 0 {
            (count as f64 / total as f64 * 100.0).min(99.0)
        } else {
            0.0
        };
        self.state.observe(
            self.stage,
            StageProgress {
                progress: Some(progress),
                current_task: Some(label.to_string()),
                items_processed: Some(count),
                total_items: Some(total),
            },
        );
    }
}

impl AnalysisProgress for StageSink<'_> {
    fn message(&self, message: &str) {
        if self.state.stage_status(self.stage) != StageStatus::Running {
            return;
        }
        self.state.observe(
            self.stage,
            StageProgress {
                current_task: Some(message.to_string()),
                ..Default::default()
            },
        );
        self.state.log(Severity::Annotation, Some(self.stage), message);
    }

    fn percent(&self, percent: f64, message: &str) {
        self.state.observe(
            self.stage,
            StageProgress {
                progress: Some(percent.min(99.0)),
                current_task: Some(message.to_string()),
                ..Default::default()
            },
        );
    }
}
