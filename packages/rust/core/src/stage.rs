//! Pipeline stage identity and the per-stage state machine.
//!
//! ```text
//! pending ──start──▶ running ──complete──▶ complete
//!    │                 │  ▲
//!    │                 │  └─update (observational)
//!    │                 └────fail──────▶ error
//!    └────skip─────▶ skipped   (cache replay only)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use seoscope_shared::{Result, SeoscopeError};

// ---------------------------------------------------------------------------
// StageId
// ---------------------------------------------------------------------------

/// The fixed set of pipeline stages, in definition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Crawl,
    Rank,
    Competitor,
    Technical,
    Content,
    #[serde(rename = "actionplan")]
    ActionPlan,
    Summary,
}

impl StageId {
    /// Every stage, in definition order.
    pub const ALL: [StageId; 7] = [
        Self::Crawl,
        Self::Rank,
        Self::Competitor,
        Self::Technical,
        Self::Content,
        Self::ActionPlan,
        Self::Summary,
    ];

    /// Stages whose output the result cache can replay.
    pub const CACHEABLE: [StageId; 4] = [Self::Rank, Self::Competitor, Self::Technical, Self::Content];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Rank => "rank",
            Self::Competitor => "competitor",
            Self::Technical => "technical",
            Self::Content => "content",
            Self::ActionPlan => "actionplan",
            Self::Summary => "summary",
        }
    }

    /// Human-readable stage name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Crawl => "Discover pages",
            Self::Rank => "Rank pages",
            Self::Competitor => "Competitor analysis",
            Self::Technical => "Technical audit",
            Self::Content => "Content analysis",
            Self::ActionPlan => "Action plan",
            Self::Summary => "Executive summary",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Crawl => "Collect the site's URLs from its sitemap",
            Self::Rank => "Order URLs by estimated SEO value and keep the top pages",
            Self::Competitor => "Compare the site against competing domains",
            Self::Technical => "Check crawlability, performance and markup",
            Self::Content => "Assess each page's content and on-page signals",
            Self::ActionPlan => "Turn findings into a prioritised plan",
            Self::Summary => "Condense findings into an executive view",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StageStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Error,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineStage
// ---------------------------------------------------------------------------

/// An observational update to a running stage. `None` fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct StageProgress {
    pub progress: Option<f64>,
    pub current_task: Option<String>,
    pub items_processed: Option<usize>,
    pub total_items: Option<usize>,
}

/// One step of a pipeline run. Mutated only through its transition methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    id: StageId,
    name: String,
    description: String,
    status: StageStatus,
    progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    items_processed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PipelineStage {
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            name: id.name().to_string(),
            description: id.description().to_string(),
            status: StageStatus::Pending,
            progress: 0.0,
            items_processed: None,
            total_items: None,
            current_task: None,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn status(&self) -> StageStatus {
        self.status
    }
    /// Percentage in `[0, 100]`.
    pub fn progress(&self) -> f64 {
        self.progress
    }
    pub fn items_processed(&self) -> Option<usize> {
        self.items_processed
    }
    pub fn total_items(&self) -> Option<usize> {
        self.total_items
    }
    pub fn current_task(&self) -> Option<&str> {
        self.current_task.as_deref()
    }
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }
    /// Failure message of a stage in `error`.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// `pending → running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(StageStatus::Pending, StageStatus::Running)?;
        self.status = StageStatus::Running;
        self.started_at = Some(now);
        self.current_task = None;
        Ok(())
    }

    /// `running → running`: record progress without changing status.
    pub fn update(&mut self, update: StageProgress) -> Result<()> {
        self.require(StageStatus::Running, StageStatus::Running)?;
        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0.0, 100.0);
        }
        if let Some(task) = update.current_task {
            self.current_task = Some(task);
        }
        if update.items_processed.is_some() {
            self.items_processed = update.items_processed;
        }
        if update.total_items.is_some() {
            self.total_items = update.total_items;
        }
        Ok(())
    }

    /// `running → complete`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(StageStatus::Running, StageStatus::Complete)?;
        self.status = StageStatus::Complete;
        self.progress = 100.0;
        self.ended_at = Some(now);
        Ok(())
    }

    /// `running → error`. Progress stays where the stage died.
    pub fn fail(&mut self, now: DateTime<Utc>, message: impl Into<String>) -> Result<()> {
        self.require(StageStatus::Running, StageStatus::Error)?;
        self.status = StageStatus::Error;
        self.ended_at = Some(now);
        self.error = Some(message.into());
        Ok(())
    }

    /// `pending → skipped`, used only when replaying cached results.
    pub fn skip(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(StageStatus::Pending, StageStatus::Skipped)?;
        self.status = StageStatus::Skipped;
        self.progress = 100.0;
        self.ended_at = Some(now);
        Ok(())
    }

    fn require(&self, from: StageStatus, to: StageStatus) -> Result<()> {
        if self.status == from {
            Ok(())
        } else {
            Err(SeoscopeError::InvalidTransition {
                stage: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn happy_path_sets_timing_and_progress() {
        let t0 = Utc::now();
        let mut stage = PipelineStage::new(StageId::Technical);
        assert_eq!(stage.status(), StageStatus::Pending);
        assert_eq!(stage.name(), "Technical audit");

        stage.start(t0).unwrap();
        assert_eq!(stage.started_at(), Some(t0));
        stage
            .update(StageProgress {
                progress: Some(40.0),
                current_task: Some("Checking robots.txt".into()),
                items_processed: Some(4),
                total_items: Some(10),
            })
            .unwrap();
        assert_eq!(stage.current_task(), Some("Checking robots.txt"));
        assert_eq!(stage.items_processed(), Some(4));

        stage.complete(t0 + Duration::seconds(3)).unwrap();
        assert_eq!(stage.status(), StageStatus::Complete);
        assert_eq!(stage.progress(), 100.0);
        assert_eq!(stage.ended_at(), Some(t0 + Duration::seconds(3)));
    }

    #[test]
    fn error_keeps_partial_progress() {
        let mut stage = PipelineStage::new(StageId::Content);
        stage.start(Utc::now()).unwrap();
        stage
            .update(StageProgress {
                progress: Some(62.5),
                ..Default::default()
            })
            .unwrap();
        stage.fail(Utc::now(), "provider quota exhausted").unwrap();

        assert_eq!(stage.status(), StageStatus::Error);
        assert_eq!(stage.progress(), 62.5);
        assert_eq!(stage.error(), Some("provider quota exhausted"));
    }

    #[test]
    fn skip_only_from_pending() {
        let mut stage = PipelineStage::new(StageId::Rank);
        stage.skip(Utc::now()).unwrap();
        assert_eq!(stage.status(), StageStatus::Skipped);
        assert_eq!(stage.progress(), 100.0);
        assert!(stage.started_at().is_none());

        let mut running = PipelineStage::new(StageId::Rank);
        running.start(Utc::now()).unwrap();
        let err = running.skip(Utc::now()).unwrap_err();
        assert!(err.to_string().contains("running -> skipped"));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let now = Utc::now();
        let mut stage = PipelineStage::new(StageId::Summary);
        stage.start(now).unwrap();
        stage.complete(now).unwrap();

        assert!(stage.start(now).is_err());
        assert!(stage.fail(now, "late").is_err());
        assert!(stage.update(StageProgress::default()).is_err());
        assert!(stage.complete(now).is_err());
        assert_eq!(stage.status(), StageStatus::Complete);
    }

    #[test]
    fn pending_cannot_complete_or_update() {
        let mut stage = PipelineStage::new(StageId::Crawl);
        assert!(stage.complete(Utc::now()).is_err());
        assert!(stage.fail(Utc::now(), "x").is_err());
        assert!(stage.update(StageProgress::default()).is_err());
        assert_eq!(stage.status(), StageStatus::Pending);
    }

    #[test]
    fn progress_is_clamped() {
        let mut stage = PipelineStage::new(StageId::Crawl);
        stage.start(Utc::now()).unwrap();
        stage
            .update(StageProgress {
                progress: Some(140.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stage.progress(), 100.0);
    }

    #[test]
    fn ids_serialize_as_wire_names() {
        assert_eq!(serde_json::to_string(&StageId::ActionPlan).unwrap(), r#""actionplan""#);
        assert_eq!(serde_json::to_string(&StageStatus::Skipped).unwrap(), r#""skipped""#);
        assert_eq!(StageId::ALL.len(), 7);
    }
}
