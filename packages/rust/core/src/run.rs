//! Run-level state: activity log, partial results, and the observable snapshot.
//!
//! The orchestrator owns a [`RunState`] and is the only writer. Callers see
//! cloned [`RunSnapshot`]s through a [`RunHandle`], either on demand or as a
//! `watch` stream of every change.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use seoscope_shared::{Result, RunId};

use crate::stage::{PipelineStage, StageId, StageProgress, StageStatus};

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    /// A sub-step worth showing but not worth a level.
    Annotation,
}

/// One line of the run's activity log. Entries are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Partial results
// ---------------------------------------------------------------------------

/// A single write to [`PartialResults`].
#[derive(Debug, Clone)]
pub enum Partial {
    DiscoveredCount(usize),
    AnalyzedCount(usize),
    Competitor(Value),
    Technical(Value),
    Content(Value),
    SiteWide(Value),
    PerPage(Value),
    ActionPlan(Value),
    Summary(Value),
}

/// Whatever the run has produced so far. Each slot is written at most once
/// and survives a failed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialResults {
    pub discovered_count: Option<usize>,
    pub analyzed_count: Option<usize>,
    pub competitor: Option<Value>,
    pub technical: Option<Value>,
    pub content: Option<Value>,
    pub site_wide: Option<Value>,
    pub per_page: Option<Value>,
    pub action_plan: Option<Value>,
    pub summary: Option<Value>,
}

impl PartialResults {
    /// Fill one slot. Returns `false`, leaving the first value in place, when
    /// the slot is already set.
    pub fn record(&mut self, partial: Partial) -> bool {
        fn fill<T>(slot: &mut Option<T>, value: T) -> bool {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        }

        match partial {
            Partial::DiscoveredCount(n) => fill(&mut self.discovered_count, n),
            Partial::AnalyzedCount(n) => fill(&mut self.analyzed_count, n),
            Partial::Competitor(v) => fill(&mut self.competitor, v),
            Partial::Technical(v) => fill(&mut self.technical, v),
            Partial::Content(v) => fill(&mut self.content, v),
            Partial::SiteWide(v) => fill(&mut self.site_wide, v),
            Partial::PerPage(v) => fill(&mut self.per_page, v),
            Partial::ActionPlan(v) => fill(&mut self.action_plan, v),
            Partial::Summary(v) => fill(&mut self.summary, v),
        }
    }
}

// ---------------------------------------------------------------------------
// Run snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Complete,
    Error,
}

/// Why a run ended in [`RunStatus::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The request or the crawl gave the pipeline nothing to work with.
    Input,
    /// A crawler, ranker, or analysis provider failed.
    Collaborator,
    /// The caller aborted the run.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    pub message: String,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub seed_url: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub stages: Vec<PipelineStage>,
    pub log: Vec<ActivityLogEntry>,
    pub partial: PartialResults,
    /// `None` until the cache has been consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub(crate) fn new(id: RunId, seed_url: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            seed_url: seed_url.to_string(),
            status: RunStatus::Running,
            failure: None,
            stages: StageId::ALL.iter().copied().map(PipelineStage::new).collect(),
            log: Vec::new(),
            partial: PartialResults::default(),
            cache_hit: None,
            started_at: now,
            ended_at: None,
        }
    }

    pub fn stage(&self, id: StageId) -> &PipelineStage {
        // Stages are created from `StageId::ALL`, so index == definition order.
        &self.stages[id as usize]
    }

    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }

    /// Mean of all stage progress values, in `[0, 100]`.
    pub fn overall_progress(&self) -> f64 {
        if self.stages.is_empty() {
            return 0.0;
        }
        self.stages.iter().map(PipelineStage::progress).sum::<f64>() / self.stages.len() as f64
    }

    /// Linear extrapolation of the time still needed, from elapsed time and
    /// overall progress. `None` before any progress has been made.
    pub fn remaining_estimate(&self, now: DateTime<Utc>) -> Option<Duration> {
        let progress = self.overall_progress();
        if progress <= 0.0 {
            return None;
        }
        let elapsed = self.ended_at.unwrap_or(now) - self.started_at;
        let elapsed_ms = elapsed.num_milliseconds().max(0) as f64;
        let remaining_ms = elapsed_ms * (100.0 - progress) / progress;
        Some(Duration::milliseconds(remaining_ms.round() as i64))
    }

    fn stage_mut(&mut self, id: StageId) -> &mut PipelineStage {
        &mut self.stages[id as usize]
    }
}

// ---------------------------------------------------------------------------
// RunState (orchestrator side)
// ---------------------------------------------------------------------------

/// Single-writer owner of a run's snapshot. Every mutation is published to
/// subscribers and mirrored to `tracing`.
pub(crate) struct RunState {
    id: RunId,
    tx: watch::Sender<RunSnapshot>,
}

impl RunState {
    pub fn new(snapshot: RunSnapshot) -> (Self, watch::Receiver<RunSnapshot>) {
        let id = snapshot.id;
        let (tx, rx) = watch::channel(snapshot);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.tx.borrow().clone()
    }

    pub fn stage_status(&self, id: StageId) -> StageStatus {
        self.tx.borrow().stage(id).status()
    }

    /// Append an activity log entry.
    pub fn log(&self, severity: Severity, stage: Option<StageId>, message: impl Into<String>) {
        let message = message.into();
        let stage_name = stage.map(|s| s.as_str()).unwrap_or("-");
        match severity {
            Severity::Info | Severity::Success => {
                info!(run_id = %self.id, stage = stage_name, "{message}")
            }
            Severity::Warning => warn!(run_id = %self.id, stage = stage_name, "{message}"),
            Severity::Error => error!(run_id = %self.id, stage = stage_name, "{message}"),
            Severity::Annotation => debug!(run_id = %self.id, stage = stage_name, "{message}"),
        }
        let entry = ActivityLogEntry {
            timestamp: Utc::now(),
            severity,
            stage,
            message,
        };
        self.tx.send_modify(|snap| snap.log.push(entry));
    }

    pub fn start_stage(&self, id: StageId) {
        if self.transition(id, |s| s.start(Utc::now())) {
            self.log(Severity::Info, Some(id), format!("{} started", id.name()));
        }
    }

    pub fn complete_stage(&self, id: StageId) {
        if self.transition(id, |s| s.complete(Utc::now())) {
            self.log(Severity::Success, Some(id), format!("{} complete", id.name()));
        }
    }

    pub fn fail_stage(&self, id: StageId, message: &str) {
        if self.transition(id, |s| s.fail(Utc::now(), message)) {
            self.log(Severity::Error, Some(id), format!("{} failed: {message}", id.name()));
        }
    }

    pub fn skip_stage(&self, id: StageId) {
        if self.transition(id, |s| s.skip(Utc::now())) {
            self.log(Severity::Info, Some(id), format!("{} skipped, using cached results", id.name()));
        }
    }

    /// Progress report from a collaborator. Ignored once the stage has left
    /// `running`, since reports can trail a cancellation.
    pub fn observe(&self, id: StageId, progress: StageProgress) {
        self.tx.send_if_modified(|snap| {
            let stage = snap.stage_mut(id);
            stage.status() == StageStatus::Running && stage.update(progress).is_ok()
        });
    }

    pub fn record(&self, partial: Partial) {
        let mut accepted = true;
        let label = partial_label(&partial);
        self.tx.send_if_modified(|snap| {
            accepted = snap.partial.record(partial);
            accepted
        });
        if !accepted {
            warn!(run_id = %self.id, slot = label, "partial result already set, keeping first value");
        }
    }

    pub fn set_cache_hit(&self, hit: bool) {
        self.tx.send_modify(|snap| snap.cache_hit = Some(hit));
    }

    /// Mark the run complete.
    pub fn finish(&self) {
        self.tx.send_modify(|snap| {
            snap.status = RunStatus::Complete;
            snap.ended_at = Some(Utc::now());
        });
        self.log(Severity::Success, None, "Analysis complete");
    }

    /// Mark the run failed. Every stage still running is forced to `error`;
    /// pending stages stay pending and partial results are kept.
    pub fn abort(&self, failure: RunFailure) {
        let running: Vec<StageId> = self
            .tx
            .borrow()
            .stages
            .iter()
            .filter(|s| s.status() == StageStatus::Running)
            .map(PipelineStage::id)
            .collect();

        for id in running {
            let message = if failure.kind == FailureKind::Cancelled {
                "cancelled by caller".to_string()
            } else if Some(id) == failure.stage {
                failure.message.clone()
            } else {
                match failure.stage {
                    Some(culprit) => format!("aborted after {culprit} failed"),
                    None => "aborted".to_string(),
                }
            };
            self.fail_stage(id, &message);
        }

        let summary = match failure.kind {
            FailureKind::Cancelled => "Analysis cancelled".to_string(),
            _ => format!("Analysis failed: {}", failure.message),
        };
        self.tx.send_modify(|snap| {
            snap.status = RunStatus::Error;
            snap.failure = Some(failure);
            snap.ended_at = Some(Utc::now());
        });
        self.log(Severity::Error, None, summary);
    }

    /// Settle a run whose driver stopped without reaching a terminal status.
    /// The first stage still running takes the blame. A finished run is left alone.
    pub(crate) fn abort_unexpected(&self, message: String) {
        let (finished, culprit) = {
            let snap = self.tx.borrow();
            let culprit = snap
                .stages
                .iter()
                .find(|s| s.status() == StageStatus::Running)
                .map(PipelineStage::id);
            (snap.status != RunStatus::Running, culprit)
        };
        if finished {
            warn!(run_id = %self.id, error = %message, "run task ended abnormally after finishing");
            return;
        }
        self.abort(RunFailure {
            kind: FailureKind::Collaborator,
            stage: culprit,
            message,
        });
    }

    /// Apply a stage transition. An illegal transition is an orchestrator
    /// bug: it panics in debug builds and is dropped with a warning otherwise.
    fn transition(&self, id: StageId, apply: impl FnOnce(&mut PipelineStage) -> Result<()>) -> bool {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|snap| {
            outcome = apply(snap.stage_mut(id));
            outcome.is_ok()
        });
        match outcome {
            Ok(()) => true,
            Err(e) => {
                debug_assert!(false, "{e}");
                warn!(run_id = %self.id, stage = %id, error = %e, "ignoring illegal stage transition");
                false
            }
        }
    }
}

fn partial_label(partial: &Partial) -> &'static str {
    match partial {
        Partial::DiscoveredCount(_) => "discovered_count",
        Partial::AnalyzedCount(_) => "analyzed_count",
        Partial::Competitor(_) => "competitor",
        Partial::Technical(_) => "technical",
        Partial::Content(_) => "content",
        Partial::SiteWide(_) => "site_wide",
        Partial::PerPage(_) => "per_page",
        Partial::ActionPlan(_) => "action_plan",
        Partial::Summary(_) => "summary",
    }
}

// ---------------------------------------------------------------------------
// RunHandle (caller side)
// ---------------------------------------------------------------------------

/// Caller's handle on a submitted run.
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    rx: watch::Receiver<RunSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunHandle {
    pub(crate) fn new(
        id: RunId,
        rx: watch::Receiver<RunSnapshot>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self { id, rx, cancel, task }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    /// Current state of the run.
    pub fn snapshot(&self) -> RunSnapshot {
        self.rx.borrow().clone()
    }

    /// Stream of snapshots; the receiver wakes on every state change.
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.rx.clone()
    }

    /// Request cancellation. The run ends in `error` at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end and return its final snapshot.
    pub async fn wait(self) -> RunSnapshot {
        if let Err(e) = self.task.await {
            warn!(run_id = %self.id, error = %e, "run task ended abnormally");
        }
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> RunSnapshot {
        RunSnapshot::new(RunId::new(), "https://shop.example", Utc::now())
    }

    #[test]
    fn new_snapshot_has_every_stage_pending() {
        let snap = snapshot();
        assert_eq!(snap.stages.len(), 7);
        for (i, id) in StageId::ALL.iter().enumerate() {
            assert_eq!(snap.stages[i].id(), *id);
            assert_eq!(snap.stage(*id).status(), StageStatus::Pending);
        }
        assert_eq!(snap.overall_progress(), 0.0);
        assert!(snap.remaining_estimate(Utc::now()).is_none());
    }

    #[test]
    fn overall_progress_is_mean_of_stages() {
        let mut snap = snapshot();
        snap.stage_mut(StageId::Crawl).start(Utc::now()).unwrap();
        snap.stage_mut(StageId::Crawl).complete(Utc::now()).unwrap();
        snap.stage_mut(StageId::Rank).skip(Utc::now()).unwrap();
        // 200 / 7
        assert!((snap.overall_progress() - 200.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn remaining_estimate_extrapolates_linearly() {
        let mut snap = snapshot();
        let t0 = snap.started_at;
        for id in [StageId::Crawl, StageId::Rank, StageId::Competitor] {
            snap.stage_mut(id).skip(t0).unwrap();
        }
        let crawl_like = snap.stage_mut(StageId::Technical);
        crawl_like.start(t0).unwrap();
        crawl_like
            .update(StageProgress {
                progress: Some(50.0),
                ..Default::default()
            })
            .unwrap();
        // (300 + 50) / 7 = 50% overall, so remaining == elapsed.
        let eta = snap.remaining_estimate(t0 + Duration::seconds(40)).unwrap();
        assert_eq!(eta, Duration::seconds(40));
    }

    #[test]
    fn partial_slots_are_write_once() {
        let mut partial = PartialResults::default();
        assert!(partial.record(Partial::DiscoveredCount(12)));
        assert!(!partial.record(Partial::DiscoveredCount(99)));
        assert_eq!(partial.discovered_count, Some(12));

        assert!(partial.record(Partial::Technical(json!({"score": 71}))));
        assert!(!partial.record(Partial::Technical(json!({"score": 0}))));
        assert_eq!(partial.technical, Some(json!({"score": 71})));
    }

    #[tokio::test]
    async fn state_changes_reach_subscribers() {
        let (state, mut rx) = RunState::new(snapshot());
        state.start_stage(StageId::Crawl);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().stage(StageId::Crawl).status(), StageStatus::Running);

        state.record(Partial::DiscoveredCount(3));
        state.complete_stage(StageId::Crawl);
        let snap = state.snapshot();
        assert_eq!(snap.partial.discovered_count, Some(3));
        assert!(snap.log.iter().any(|e| e.severity == Severity::Success));
    }

    #[test]
    fn observe_ignores_stages_that_are_not_running() {
        let (state, _rx) = RunState::new(snapshot());
        state.observe(
            StageId::Content,
            StageProgress {
                progress: Some(30.0),
                ..Default::default()
            },
        );
        assert_eq!(state.snapshot().stage(StageId::Content).progress(), 0.0);
    }

    #[test]
    fn abort_errors_running_stages_and_keeps_pending() {
        let (state, _rx) = RunState::new(snapshot());
        state.start_stage(StageId::Crawl);
        state.complete_stage(StageId::Crawl);
        state.start_stage(StageId::Competitor);
        state.start_stage(StageId::Technical);
        state.record(Partial::DiscoveredCount(5));

        state.abort(RunFailure {
            kind: FailureKind::Collaborator,
            stage: Some(StageId::Technical),
            message: "timeout".into(),
        });

        let snap = state.snapshot();
        assert_eq!(snap.status, RunStatus::Error);
        assert!(snap.ended_at.is_some());
        assert_eq!(snap.stage(StageId::Technical).error(), Some("timeout"));
        assert_eq!(
            snap.stage(StageId::Competitor).error(),
            Some("aborted after technical failed")
        );
        assert_eq!(snap.stage(StageId::Crawl).status(), StageStatus::Complete);
        assert_eq!(snap.stage(StageId::Summary).status(), StageStatus::Pending);
        assert_eq!(snap.partial.discovered_count, Some(5));
    }

    #[test]
    fn cancellation_marks_running_stages() {
        let (state, _rx) = RunState::new(snapshot());
        state.start_stage(StageId::Crawl);
        state.abort(RunFailure {
            kind: FailureKind::Cancelled,
            stage: None,
            message: "run cancelled".into(),
        });
        let snap = state.snapshot();
        assert_eq!(snap.stage(StageId::Crawl).error(), Some("cancelled by caller"));
        assert_eq!(snap.failure.unwrap().kind, FailureKind::Cancelled);
    }

    #[test]
    fn unexpected_abort_settles_a_running_run() {
        let (state, _rx) = RunState::new(snapshot());
        state.start_stage(StageId::Crawl);
        state.complete_stage(StageId::Crawl);
        state.start_stage(StageId::Rank);

        state.abort_unexpected("internal error: index out of bounds".into());

        let snap = state.snapshot();
        assert_eq!(snap.status, RunStatus::Error);
        let failure = snap.failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::Collaborator);
        assert_eq!(failure.stage, Some(StageId::Rank));
        assert_eq!(
            snap.stage(StageId::Rank).error(),
            Some("internal error: index out of bounds")
        );
        assert_eq!(snap.stage(StageId::Crawl).status(), StageStatus::Complete);
    }

    #[test]
    fn unexpected_abort_leaves_finished_run_alone() {
        let (state, _rx) = RunState::new(snapshot());
        state.finish();
        state.abort_unexpected("late".into());

        let snap = state.snapshot();
        assert_eq!(snap.status, RunStatus::Complete);
        assert!(snap.failure.is_none());
    }
}
