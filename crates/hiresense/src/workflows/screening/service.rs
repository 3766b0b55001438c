use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, info_span, warn};

use super::aggregation::{
    AggregationError, ArtifactSources, CandidateRecord, CanonicalArtifact, ResultAggregator,
};
use super::domain::{CandidateDocument, JobPosting, RunId, RunInputs, RunStatus, StageExecution};
use super::pipeline::{
    CancellationFlag, LaunchSettings, PipelineDefinition, PipelineDefinitionError,
    PipelineRunner, StageExecutionError,
};
use super::ranking::{top_candidates, RankedCandidate};
use super::repository::{RepositoryError, RunRecord, RunRepository};
use super::store::ArtifactStore;
use super::workspace::{Workspace, WorkspaceManager, WorkspaceSetupError};
use crate::config::PipelineConfig;

/// Caller input for one screening run.
#[derive(Debug, Clone)]
pub struct ScreeningRequest {
    pub job: JobPosting,
    pub documents: Vec<CandidateDocument>,
    /// Overrides the configured shortlist size; `Some(0)` keeps every candidate.
    pub top_n: Option<usize>,
}

/// Result of a run that completed every stage and aggregated.
#[derive(Debug, Clone)]
pub struct ScreeningOutcome {
    pub run_id: RunId,
    pub records: Vec<CandidateRecord>,
    pub ranked: Vec<RankedCandidate>,
    pub published_to: Option<PathBuf>,
    pub stage_log: Vec<StageExecution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WorkspaceSetup,
    StageExecution,
    Aggregation,
    Cancelled,
}

/// Structured failure surfaced to callers and stored with the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Any failure that aborts a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    WorkspaceSetup(#[from] WorkspaceSetupError),
    #[error(transparent)]
    StageExecution(#[from] StageExecutionError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

impl RunError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RunError::WorkspaceSetup(_) => FailureKind::WorkspaceSetup,
            RunError::StageExecution(err) if err.is_cancellation() => FailureKind::Cancelled,
            RunError::StageExecution(_) => FailureKind::StageExecution,
            RunError::Aggregation(_) => FailureKind::Aggregation,
        }
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, RunError::WorkspaceSetup(err) if err.is_invalid_input())
    }

    pub fn failure(&self) -> RunFailure {
        let mut failure = RunFailure {
            kind: self.kind(),
            message: self.to_string(),
            stage: None,
            stdout: None,
            stderr: None,
        };
        if let RunError::StageExecution(err) = self {
            failure.stage = Some(err.stage.clone());
            failure.stdout = Some(err.stdout.clone());
            failure.stderr = Some(err.stderr.clone());
        }
        failure
    }

    fn stage_log(&self) -> Vec<StageExecution> {
        match self {
            RunError::StageExecution(err) => err.executions.clone(),
            _ => Vec::new(),
        }
    }
}

/// Runs the screening pipeline end to end, one isolated workspace per run.
pub struct ScreeningService<R> {
    workspaces: WorkspaceManager,
    runner: PipelineRunner,
    definition: PipelineDefinition,
    aggregator: ResultAggregator,
    store: ArtifactStore,
    repository: Arc<R>,
    output_dir: Option<PathBuf>,
    default_top_n: usize,
}

impl<R> ScreeningService<R>
where
    R: RunRepository + 'static,
{
    pub fn new(
        config: &PipelineConfig,
        definition: PipelineDefinition,
        repository: Arc<R>,
    ) -> Result<Self, PipelineDefinitionError> {
        let sources = ArtifactSources::from_definition(&definition)
            .ok_or(PipelineDefinitionError::MissingGradingStage)?;

        Ok(Self {
            workspaces: WorkspaceManager::new(&config.stage_dir),
            runner: PipelineRunner::new(LaunchSettings::from_config(config)),
            definition,
            aggregator: ResultAggregator::new(sources),
            store: ArtifactStore::new(&config.stage_dir),
            repository,
            output_dir: config.output_dir.clone(),
            default_top_n: config.default_top_n,
        })
    }

    /// Allocates run workspaces under `root` rather than the system temp directory.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspaces = self.workspaces.with_scratch_root(root);
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn run(&self, request: ScreeningRequest) -> Result<ScreeningOutcome, RunError> {
        self.run_with_cancellation(request, &CancellationFlag::new())
    }

    /// Runs the pipeline, checking `cancel` before every stage and while one is running.
    pub fn run_with_cancellation(
        &self,
        request: ScreeningRequest,
        cancel: &CancellationFlag,
    ) -> Result<ScreeningOutcome, RunError> {
        let run_id = RunId::generate();
        let span = info_span!("screening_run", run_id = %run_id);
        let _entered = span.enter();

        let top_n = request.top_n.unwrap_or(self.default_top_n);
        let mut record = RunRecord::pending(run_id.clone(), request.documents.len());
        self.save(record.clone());
        info!(candidates = request.documents.len(), top_n, "run accepted");

        let inputs = RunInputs {
            job: request.job,
            documents: request.documents,
        };

        let result = self
            .workspaces
            .create(&run_id, &inputs, &self.definition)
            .map_err(RunError::from)
            .and_then(|workspace| {
                record.start();
                self.save(record.clone());
                let completed = self.complete_run(&workspace, cancel);
                self.workspaces.teardown(workspace);
                completed
            });

        match result {
            Ok(CompletedRun {
                records,
                published_to,
                stage_log,
            }) => {
                record.finish(RunStatus::Aggregated, stage_log.clone());
                self.save(record);

                let ranked = top_candidates(&records, top_n);
                info!(
                    candidates = records.len(),
                    shortlisted = ranked.len(),
                    "run aggregated"
                );

                Ok(ScreeningOutcome {
                    run_id,
                    records,
                    ranked,
                    published_to,
                    stage_log,
                })
            }
            Err(err) => {
                warn!(kind = ?err.kind(), error = %err, "run failed");
                record.finish(RunStatus::Failed, err.stage_log());
                record.failure = Some(err.failure());
                self.save(record);
                Err(err)
            }
        }
    }

    /// Fetches the stored record of an earlier run.
    pub fn get(&self, run_id: &RunId) -> Result<RunRecord, RepositoryError> {
        self.repository
            .fetch(run_id)?
            .ok_or(RepositoryError::NotFound)
    }

    fn complete_run(
        &self,
        workspace: &Workspace,
        cancel: &CancellationFlag,
    ) -> Result<CompletedRun, RunError> {
        let result = self
            .runner
            .execute(&self.definition, workspace.root(), cancel)?;
        let artifact = self.aggregator.aggregate(workspace.root())?;

        if let Err(err) = self
            .store
            .merge_back(workspace.root(), self.definition.persisted_artifacts())
        {
            warn!(
                store = %self.store.dir().display(),
                error = %err,
                "failed to merge persisted artifacts back"
            );
        }

        let published_to = self.publish(workspace.run_id(), &artifact);
        Ok(CompletedRun {
            records: artifact.records,
            published_to,
            stage_log: result.executions,
        })
    }

    /// Copies the canonical artifact into the output directory, if one is configured.
    fn publish(&self, run_id: &RunId, artifact: &CanonicalArtifact) -> Option<PathBuf> {
        let output_dir = self.output_dir.as_ref()?;
        let target = output_dir.join(format!("final_selected_candidates-{run_id}.csv"));
        match copy_atomically(&artifact.path, &target) {
            Ok(()) => {
                info!(published = %target.display(), "canonical artifact published");
                Some(target)
            }
            Err(err) => {
                warn!(
                    target = %target.display(),
                    error = %err,
                    "failed to publish canonical artifact"
                );
                None
            }
        }
    }

    fn save(&self, record: RunRecord) {
        let run_id = record.run_id.clone();
        if let Err(err) = self.repository.save(record) {
            warn!(run_id = %run_id, error = %err, "failed to save run record");
        }
    }
}

struct CompletedRun {
    records: Vec<CandidateRecord>,
    published_to: Option<PathBuf>,
    stage_log: Vec<StageExecution>,
}

fn copy_atomically(source: &Path, target: &Path) -> io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut staged = NamedTempFile::new_in(dir)?;
    io::copy(&mut File::open(source)?, staged.as_file_mut())?;
    staged.as_file_mut().sync_all()?;
    staged.persist(target).map(|_| ()).map_err(|err| err.error)
}
