//! Pipeline orchestration for seoscope site audits.
//!
//! This crate sequences the external collaborators (crawler, ranker, analysis
//! providers) into a single observable run, consulting the result cache so
//! that a repeat audit of an unchanged URL set skips the expensive analyses.
//!
//! - [`stage`]: stage identity and the per-stage state machine
//! - [`run`]: activity log, partial results, snapshots, the caller's handle
//! - [`collaborators`]: the contracts the pipeline drives
//! - [`pipeline`]: the [`Orchestrator`] itself

pub mod collaborators;
pub mod pipeline;
pub mod run;
pub mod stage;

pub use collaborators::{
    AnalysisInputs, AnalysisProgress, AnalysisProvider, Collaborators, CrawlProgress, Crawler,
    Ranker,
};
pub use pipeline::{AuditRequest, Orchestrator};
pub use run::{
    ActivityLogEntry, FailureKind, Partial, PartialResults, RunFailure, RunHandle, RunSnapshot,
    RunStatus, Severity,
};
pub use stage::{PipelineStage, StageId, StageProgress, StageStatus};
