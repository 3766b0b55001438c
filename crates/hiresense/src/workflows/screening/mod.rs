//! Candidate screening runs.
//!
//! A run copies the job posting, the candidate documents and every stage executable into a
//! private workspace, launches the stages one after another, and merges their CSV outputs
//! into the canonical `final_selected_candidates.csv`. Nothing is written for a run that
//! fails, and the workspace is removed however the run ends.

pub mod aggregation;
pub mod domain;
pub mod pipeline;
pub mod ranking;
pub mod repository;
pub mod router;
pub mod service;
pub mod store;
pub mod workspace;

#[cfg(all(test, unix))]
mod tests;

pub use aggregation::{
    composite_score, AggregationError, ArtifactSources, CandidateRecord, CanonicalArtifact,
    ResultAggregator, CANONICAL_ARTIFACT,
};
pub use domain::{
    CandidateDocument, JobPosting, RunId, RunInputs, RunStatus, StageExecution,
};
pub use pipeline::{
    CancellationFlag, LaunchContext, LaunchSettings, PipelineDefinition, PipelineDefinitionError,
    PipelineRunner, RunResult, RunnerState, Stage, StageExecutionError, StageFailureReason,
    StageRole, WorkingDirectory,
};
pub use ranking::{top_candidates, write_ranked_csv, RankedCandidate};
pub use repository::{RepositoryError, RunRecord, RunRepository};
pub use router::{screening_router, DocumentPayload, ScreeningPayload};
pub use service::{
    FailureKind, RunError, RunFailure, ScreeningOutcome, ScreeningRequest, ScreeningService,
};
pub use store::ArtifactStore;
pub use workspace::{Workspace, WorkspaceManager, WorkspaceSetupError};
