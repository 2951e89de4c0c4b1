//! Contracts for the external work the pipeline coordinates.
//!
//! The orchestrator never crawls, ranks, or analyzes anything itself. It
//! sequences these collaborators, feeds them their inputs, and turns their
//! progress reports into stage updates.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use seoscope_shared::Result;

/// Receives crawl progress: `count` URLs found out of an estimated `total`.
pub trait CrawlProgress: Send + Sync {
    fn report(&self, count: usize, total: usize, label: &str);
}

/// Receives free-form progress from an analysis provider.
pub trait AnalysisProgress: Send + Sync {
    /// A sub-step worth surfacing in the activity log.
    fn message(&self, message: &str);
    /// Completion estimate for the stage, in `[0, 100]`.
    fn percent(&self, percent: f64, message: &str);
}

/// Discovers the URLs of a site.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn crawl(&self, seed_url: &str, progress: &dyn CrawlProgress) -> Result<Vec<String>>;
}

/// Orders URLs by estimated SEO value, most valuable first. Pure and fast.
pub trait Ranker: Send + Sync {
    fn rank(&self, urls: &[String]) -> Vec<String>;
}

/// One analysis step (competitor, technical, content, action plan, summary).
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn run(
        &self,
        config: &Value,
        inputs: &AnalysisInputs,
        progress: &dyn AnalysisProgress,
    ) -> Result<Value>;
}

/// What an analysis provider gets to work with.
///
/// The three parallel analyses see only the URL list; the synthesis steps
/// also see the assembled findings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisInputs {
    pub seed_url: String,
    pub domain: String,
    /// The URLs selected for analysis, at most `max_analyzed_urls`.
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_wide: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<Value>,
    /// Action plan output, available to the summary step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_plan: Option<Value>,
}

/// The full set of collaborators a pipeline needs.
#[derive(Clone)]
pub struct Collaborators {
    pub crawler: Arc<dyn Crawler>,
    pub ranker: Arc<dyn Ranker>,
    pub competitor: Arc<dyn AnalysisProvider>,
    pub technical: Arc<dyn AnalysisProvider>,
    pub content: Arc<dyn AnalysisProvider>,
    pub action_plan: Arc<dyn AnalysisProvider>,
    pub summary: Arc<dyn AnalysisProvider>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
