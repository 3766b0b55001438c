use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::Response;
use serde_json::Value;
use tempfile::TempDir;

use crate::config::{BackendToggle, PipelineConfig};
use crate::workflows::screening::{
    CandidateDocument, JobPosting, PipelineDefinition, RepositoryError, RunId, RunRecord,
    RunRepository, RunStatus, ScreeningRequest, ScreeningService, Stage, StageRole,
};

/// Stage directory, scratch root and output directory for one test, plus the stub stages.
pub(super) struct StageKit {
    pub(super) stage_dir: TempDir,
    pub(super) scratch: TempDir,
    pub(super) output_dir: TempDir,
    stages: Vec<Stage>,
    timeout: Option<Duration>,
}

impl StageKit {
    pub(super) fn new() -> Self {
        Self {
            stage_dir: tempfile::tempdir().expect("stage dir"),
            scratch: tempfile::tempdir().expect("scratch root"),
            output_dir: tempfile::tempdir().expect("output dir"),
            stages: Vec::new(),
            timeout: None,
        }
    }

    /// Writes `script` as `<name>.sh` and appends a stage launched through `sh`.
    pub(super) fn stage(
        mut self,
        name: &str,
        role: StageRole,
        artifact: &str,
        script: &str,
    ) -> Self {
        let file = format!("{name}.sh");
        fs::write(self.stage_dir.path().join(&file), script).expect("write stub stage");
        self.stages
            .push(Stage::new(name, role, file, artifact).with_interpreter("sh"));
        self
    }

    pub(super) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(super) fn seed(&self, name: &str, contents: &str) {
        fs::write(self.stage_dir.path().join(name), contents).expect("seed stage dir");
    }

    pub(super) fn config(&self) -> PipelineConfig {
        PipelineConfig {
            stage_dir: self.stage_dir.path().to_path_buf(),
            interpreter: "sh".to_string(),
            backend_toggle: BackendToggle::pytorch_only(),
            stage_timeout: self.timeout,
            output_dir: Some(self.output_dir.path().to_path_buf()),
            default_top_n: 10,
        }
    }

    pub(super) fn definition(&self) -> PipelineDefinition {
        PipelineDefinition::new(self.stages.clone()).expect("valid stub pipeline")
    }

    pub(super) fn service(
        &self,
    ) -> (ScreeningService<MemoryRunRepository>, Arc<MemoryRunRepository>) {
        let repository = Arc::new(MemoryRunRepository::default());
        let service = self.service_with(repository.clone());
        (service, repository)
    }

    pub(super) fn service_with<R: RunRepository + 'static>(
        &self,
        repository: Arc<R>,
    ) -> ScreeningService<R> {
        ScreeningService::new(&self.config(), self.definition(), repository)
            .expect("service builds")
            .with_scratch_root(self.scratch.path())
    }

    pub(super) fn leftover_workspaces(&self) -> usize {
        fs::read_dir(self.scratch.path())
            .expect("scratch root readable")
            .count()
    }

    pub(super) fn published(&self) -> Vec<PathBuf> {
        let mut files: Vec<_> = fs::read_dir(self.output_dir.path())
            .expect("output dir readable")
            .map(|entry| entry.expect("entry").path())
            .collect();
        files.sort();
        files
    }

    pub(super) fn stage_file(&self, name: &str) -> PathBuf {
        self.stage_dir.path().join(name)
    }
}

/// A stage that writes `body` verbatim to `artifact`.
pub(super) fn writes_csv(artifact: &str, body: &str) -> String {
    format!("cat > {artifact} <<'CSV'\n{body}CSV\n")
}

/// A grader that scores every uploaded document 0.5.
pub(super) fn listing_grader() -> String {
    r#"test -f Dataset/job_description.csv || exit 3
printf 'candidate_filename,grade_score\n' > cv_grading_results.csv
for path in Dataset/CVs1/*; do
  printf '%s,0.5\n' "${path##*/}" >> cv_grading_results.csv
done
"#
    .to_string()
}

pub(super) fn failing(code: i32, stderr: &str) -> String {
    format!("echo 'partial output'\necho '{stderr}' >&2\nexit {code}\n")
}

/// A stage that records its launch by creating `marker`.
pub(super) fn touches(marker: &Path) -> String {
    format!("touch '{}'\n", marker.display())
}

pub(super) const SCENARIO_GRADES: &str =
    "candidate_filename,grade_score\na.pdf,0.9\nb.pdf,0.5\nc.pdf,1.0\n";
pub(super) const SCENARIO_PERSONA: &str =
    "candidate_filename,persona_fit_score\na.pdf,0.5\nb.pdf,0.0\nc.pdf,1.0\n";
pub(super) const SCENARIO_BIAS: &str = "candidate_filename,cv_bias_flags\n\
a.pdf,[]\n\
b.pdf,\"['rockstar', 'young']\"\n\
c.pdf,\"['1','2','3','4','5','6','7','8','9','10','11']\"\n";
pub(super) const SCENARIO_EXPLANATIONS: &str = "candidate_filename,explanation\n\
a.pdf,strong python background\n\
b.pdf,partial match\n\
c.pdf,excellent fit\n";

/// Grading, bias, persona and explanation stubs over candidates a, b and c.
pub(super) fn scenario_kit(persona: &str, bias: &str) -> StageKit {
    StageKit::new()
        .stage(
            "cv_grader",
            StageRole::Grading,
            "cv_grading_results.csv",
            &writes_csv("cv_grading_results.csv", SCENARIO_GRADES),
        )
        .stage(
            "bias_agent",
            StageRole::Bias,
            "cv_bias_fairness.csv",
            &writes_csv("cv_bias_fairness.csv", bias),
        )
        .stage(
            "persona_agent",
            StageRole::PersonaFit,
            "persona_fit_results.csv",
            &writes_csv("persona_fit_results.csv", persona),
        )
        .stage(
            "explainability_agent",
            StageRole::Explanation,
            "explainability_results.csv",
            &writes_csv("explainability_results.csv", SCENARIO_EXPLANATIONS),
        )
}

pub(super) fn request(filenames: &[&str]) -> ScreeningRequest {
    ScreeningRequest {
        job: JobPosting {
            title: "Data Engineer".to_string(),
            description: "Python, SQL, and pipeline ownership.".to_string(),
        },
        documents: filenames
            .iter()
            .map(|name| CandidateDocument::new(*name, format!("%PDF-1.4 {name}").into_bytes()))
            .collect(),
        top_n: None,
    }
}

pub(super) fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

#[derive(Default, Clone)]
pub(super) struct MemoryRunRepository {
    pub(super) records: Arc<Mutex<HashMap<RunId, RunRecord>>>,
    saved_statuses: Arc<Mutex<Vec<RunStatus>>>,
}

impl MemoryRunRepository {
    /// Status of every saved snapshot, in save order.
    pub(super) fn saved_statuses(&self) -> Vec<RunStatus> {
        self.saved_statuses
            .lock()
            .expect("repository mutex poisoned")
            .clone()
    }

    pub(super) fn all(&self) -> Vec<RunRecord> {
        self.records
            .lock()
            .expect("repository mutex poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl RunRepository for MemoryRunRepository {
    fn save(&self, record: RunRecord) -> Result<(), RepositoryError> {
        self.saved_statuses
            .lock()
            .expect("repository mutex poisoned")
            .push(record.status);
        self.records
            .lock()
            .expect("repository mutex poisoned")
            .insert(record.run_id.clone(), record);
        Ok(())
    }

    fn fetch(&self, id: &RunId) -> Result<Option<RunRecord>, RepositoryError> {
        let guard = self.records.lock().expect("repository mutex poisoned");
        Ok(guard.get(id).cloned())
    }
}

pub(super) struct UnavailableRunRepository;

impl RunRepository for UnavailableRunRepository {
    fn save(&self, _record: RunRecord) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch(&self, _id: &RunId) -> Result<Option<RunRecord>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
