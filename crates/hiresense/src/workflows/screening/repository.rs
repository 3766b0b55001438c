use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{RunId, RunStatus, StageExecution};
use super::service::RunFailure;

/// Stored history of one run: status, stage log, and failure if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub candidate_count: usize,
    pub stage_log: Vec<StageExecution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl RunRecord {
    /// A run that has been accepted but whose workspace is not built yet.
    pub fn pending(run_id: RunId, candidate_count: usize) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            candidate_count,
            stage_log: Vec::new(),
            failure: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = RunStatus::Running;
    }

    pub(crate) fn finish(&mut self, status: RunStatus, stage_log: Vec<StageExecution>) {
        self.status = status;
        self.stage_log = stage_log;
        self.finished_at = Some(Utc::now());
    }
}

/// Storage abstraction for run history.
pub trait RunRepository: Send + Sync {
    fn save(&self, record: RunRecord) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &RunId) -> Result<Option<RunRecord>, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("run not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}
