use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::aggregation::CANONICAL_ARTIFACT;
use super::domain::{CandidateDocument, JobPosting, RunId, RunInputs};
use super::pipeline::PipelineDefinition;

/// Job posting descriptor read by the first stage.
pub const JOB_DESCRIPTION_PATH: &str = "Dataset/job_description.csv";
/// Directory holding one file per uploaded candidate document.
pub const CANDIDATES_DIR: &str = "Dataset/CVs1";
/// Extensions of shared stage-directory files copied into every workspace.
pub const PERSISTED_EXTENSIONS: &[&str] = &["csv", "db"];

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceSetupError {
    #[error("invalid run input: {0}")]
    InvalidInput(String),
    #[error("candidate document name `{0}` is not a plain file name")]
    InvalidDocumentName(String),
    #[error("candidate document `{0}` was uploaded more than once")]
    DuplicateDocument(String),
    #[error("stage `{stage}` executable is missing: {}", path.display())]
    MissingExecutable { stage: String, path: PathBuf },
    #[error("failed to {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write job posting descriptor: {0}")]
    JobDescriptor(#[from] csv::Error),
}

impl WorkspaceSetupError {
    /// True when the caller supplied unusable inputs, as opposed to a host failure.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            WorkspaceSetupError::InvalidInput(_)
                | WorkspaceSetupError::InvalidDocumentName(_)
                | WorkspaceSetupError::DuplicateDocument(_)
        )
    }
}

fn io_error(action: impl Into<String>) -> impl FnOnce(io::Error) -> WorkspaceSetupError {
    let action = action.into();
    move |source| WorkspaceSetupError::Io { action, source }
}

/// Private directory tree for one run. Dropping it removes the tree.
#[derive(Debug)]
pub struct Workspace {
    run_id: RunId,
    dir: TempDir,
    staged_artifacts: Vec<String>,
}

impl Workspace {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn candidates_dir(&self) -> PathBuf {
        self.root().join(CANDIDATES_DIR)
    }

    /// Shared data files copied in from the stage directory.
    pub fn staged_artifacts(&self) -> &[String] {
        &self.staged_artifacts
    }
}

/// Materializes and reclaims run workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    stage_dir: PathBuf,
    scratch_root: Option<PathBuf>,
}

impl WorkspaceManager {
    pub fn new(stage_dir: impl Into<PathBuf>) -> Self {
        Self {
            stage_dir: stage_dir.into(),
            scratch_root: None,
        }
    }

    /// Creates workspaces under `root` instead of the system temp directory.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn create(
        &self,
        run_id: &RunId,
        inputs: &RunInputs,
        definition: &PipelineDefinition,
    ) -> Result<Workspace, WorkspaceSetupError> {
        validate_job(&inputs.job)?;
        let documents = validated_documents(&inputs.documents)?;
        let executables = self.locate_executables(definition)?;

        let dir = self.allocate(run_id)?;
        let root = dir.path();

        let candidates_dir = root.join(CANDIDATES_DIR);
        fs::create_dir_all(&candidates_dir).map_err(io_error("create candidates directory"))?;

        write_job_descriptor(&root.join(JOB_DESCRIPTION_PATH), &inputs.job)?;

        for (name, document) in documents {
            fs::write(candidates_dir.join(name), &document.content)
                .map_err(io_error(format!("write candidate document `{name}`")))?;
        }

        for (source, staged_name) in executables {
            fs::copy(&source, root.join(&staged_name)).map_err(io_error(format!(
                "stage executable {}",
                source.display()
            )))?;
        }

        let staged_artifacts = self.stage_shared_files(root, definition)?;

        info!(
            run_id = %run_id,
            workspace = %root.display(),
            documents = inputs.documents.len(),
            staged_artifacts = staged_artifacts.len(),
            "workspace ready"
        );

        Ok(Workspace {
            run_id: run_id.clone(),
            dir,
            staged_artifacts,
        })
    }

    /// Removes the workspace tree. Failures are logged; the directory is unusable either way.
    pub fn teardown(&self, workspace: Workspace) {
        let run_id = workspace.run_id.clone();
        let path = workspace.root().to_path_buf();
        match workspace.dir.close() {
            Ok(()) => debug!(run_id = %run_id, "workspace removed"),
            Err(err) => warn!(
                run_id = %run_id,
                workspace = %path.display(),
                error = %err,
                "failed to remove workspace"
            ),
        }
    }

    fn allocate(&self, run_id: &RunId) -> Result<TempDir, WorkspaceSetupError> {
        let prefix = format!("hiresense-{run_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let allocated = match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root).map_err(io_error("create scratch root"))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        allocated.map_err(io_error("allocate workspace directory"))
    }

    fn locate_executables(
        &self,
        definition: &PipelineDefinition,
    ) -> Result<Vec<(PathBuf, PathBuf)>, WorkspaceSetupError> {
        definition
            .stages()
            .iter()
            .map(|stage| {
                let source = self.stage_dir.join(&stage.executable);
                let staged_name = stage.staged_name().map(PathBuf::from);
                match staged_name {
                    Some(staged_name) if source.is_file() => Ok((source, staged_name)),
                    _ => Err(WorkspaceSetupError::MissingExecutable {
                        stage: stage.name.clone(),
                        path: source,
                    }),
                }
            })
            .collect()
    }

    /// Copies shared data files into the workspace. Files named like a stage output or the
    /// canonical artifact are left behind so a run never starts with another run's results.
    fn stage_shared_files(
        &self,
        root: &Path,
        definition: &PipelineDefinition,
    ) -> Result<Vec<String>, WorkspaceSetupError> {
        let entries = match fs::read_dir(&self.stage_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("list stage directory")(err)),
        };

        let mut staged = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error("list stage directory"))?;
            let path = entry.path();
            if !path.is_file() || !is_shared_file(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if name == CANONICAL_ARTIFACT || definition.is_run_output(name) {
                debug!(name, "not staging a stale stage output");
                continue;
            }
            fs::copy(&path, root.join(name))
                .map_err(io_error(format!("stage persisted artifact `{name}`")))?;
            staged.push(name.to_string());
        }
        staged.sort();
        Ok(staged)
    }
}

fn is_shared_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            PERSISTED_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn validate_job(job: &JobPosting) -> Result<(), WorkspaceSetupError> {
    if job.title.trim().is_empty() {
        return Err(WorkspaceSetupError::InvalidInput(
            "job title is required".to_string(),
        ));
    }
    if job.description.trim().is_empty() {
        return Err(WorkspaceSetupError::InvalidInput(
            "job description is required".to_string(),
        ));
    }
    Ok(())
}

fn validated_documents(
    documents: &[CandidateDocument],
) -> Result<Vec<(&str, &CandidateDocument)>, WorkspaceSetupError> {
    if documents.is_empty() {
        return Err(WorkspaceSetupError::InvalidInput(
            "at least one candidate document is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    documents
        .iter()
        .map(|document| {
            let name = plain_file_name(&document.filename)
                .ok_or_else(|| {
                    WorkspaceSetupError::InvalidDocumentName(document.filename.clone())
                })?;
            if !seen.insert(name) {
                return Err(WorkspaceSetupError::DuplicateDocument(name.to_string()));
            }
            Ok((name, document))
        })
        .collect()
}

/// Accepts only a single normal path component, so uploads cannot escape the candidates dir.
fn plain_file_name(raw: &str) -> Option<&str> {
    let name = raw.trim();
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.starts_with('.');
    (!invalid).then_some(name)
}

fn write_job_descriptor(path: &Path, job: &JobPosting) -> Result<(), WorkspaceSetupError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["Job Title", "Job Description"])?;
    writer.write_record([job.title.as_str(), job.description.as_str()])?;
    writer.flush().map_err(io_error("flush job posting descriptor"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::screening::pipeline::{Stage, StageRole};

    fn inputs(names: &[&str]) -> RunInputs {
        RunInputs {
            job: JobPosting {
                title: "Data Engineer".to_string(),
                description: "Build pipelines, \"own\" the warehouse".to_string(),
            },
            documents: names
                .iter()
                .map(|name| CandidateDocument::new(*name, format!("cv of {name}").into_bytes()))
                .collect(),
        }
    }

    fn definition() -> PipelineDefinition {
        PipelineDefinition::new(vec![Stage::new(
            "grader",
            StageRole::Grading,
            "grade.sh",
            "cv_grading_results.csv",
        )])
        .expect("valid definition")
    }

    fn stage_dir() -> TempDir {
        let dir = tempfile::tempdir().expect("stage dir");
        fs::write(dir.path().join("grade.sh"), "exit 0\n").expect("write stage");
        dir
    }

    #[test]
    fn create_lays_out_inputs_and_stages() {
        let stages = stage_dir();
        fs::write(stages.path().join("memory.db"), b"sqlite").expect("write store");
        fs::write(stages.path().join("notes.txt"), b"ignored").expect("write other");
        let manager = WorkspaceManager::new(stages.path());

        let workspace = manager
            .create(&RunId::generate(), &inputs(&["alice.pdf", "bob.pdf"]), &definition())
            .expect("workspace builds");
        let root = workspace.root();

        assert!(root.join("grade.sh").is_file());
        assert_eq!(
            fs::read(root.join(CANDIDATES_DIR).join("alice.pdf")).expect("alice"),
            b"cv of alice.pdf"
        );
        assert!(root.join(CANDIDATES_DIR).join("bob.pdf").is_file());
        assert_eq!(workspace.staged_artifacts(), ["memory.db".to_string()]);
        assert!(!root.join("notes.txt").exists());

        let mut reader = csv::Reader::from_path(root.join(JOB_DESCRIPTION_PATH)).expect("csv");
        let headers = reader.headers().expect("headers").clone();
        assert_eq!(&headers[0], "Job Title");
        let row = reader.records().next().expect("row").expect("valid row");
        assert_eq!(&row[1], "Build pipelines, \"own\" the warehouse");
    }

    #[test]
    fn stage_outputs_in_the_stage_dir_are_not_staged() {
        let stages = stage_dir();
        fs::write(stages.path().join("cv_grading_results.csv"), b"stale").expect("write");
        fs::write(stages.path().join(CANONICAL_ARTIFACT), b"stale").expect("write");
        fs::write(stages.path().join("skills.csv"), b"skill\n").expect("write");
        let manager = WorkspaceManager::new(stages.path());

        let workspace = manager
            .create(&RunId::generate(), &inputs(&["alice.pdf"]), &definition())
            .expect("workspace builds");

        assert_eq!(workspace.staged_artifacts(), ["skills.csv".to_string()]);
        assert!(!workspace.root().join("cv_grading_results.csv").exists());
        assert!(!workspace.root().join(CANONICAL_ARTIFACT).exists());
    }

    #[test]
    fn missing_executable_fails_before_allocating() {
        let stages = tempfile::tempdir().expect("stage dir");
        let scratch = tempfile::tempdir().expect("scratch");
        let manager = WorkspaceManager::new(stages.path()).with_scratch_root(scratch.path());

        let err = manager
            .create(&RunId::generate(), &inputs(&["alice.pdf"]), &definition())
            .expect_err("missing stage");

        match err {
            WorkspaceSetupError::MissingExecutable { stage, .. } => assert_eq!(stage, "grader"),
            other => panic!("expected missing executable, got {other:?}"),
        }
        assert_eq!(fs::read_dir(scratch.path()).expect("scratch").count(), 0);
    }

    #[test]
    fn rejects_traversal_in_document_names() {
        let stages = stage_dir();
        let manager = WorkspaceManager::new(stages.path());

        for name in ["../escape.pdf", "nested/cv.pdf", "..", "  ", ".hidden"] {
            let err = manager
                .create(&RunId::generate(), &inputs(&[name]), &definition())
                .expect_err("invalid name rejected");
            assert!(err.is_invalid_input(), "{name} should be rejected");
        }
    }

    #[test]
    fn rejects_duplicate_documents_and_empty_inputs() {
        let stages = stage_dir();
        let manager = WorkspaceManager::new(stages.path());

        let err = manager
            .create(&RunId::generate(), &inputs(&["a.pdf", "a.pdf"]), &definition())
            .expect_err("duplicate rejected");
        assert!(matches!(err, WorkspaceSetupError::DuplicateDocument(_)));

        let err = manager
            .create(&RunId::generate(), &inputs(&[]), &definition())
            .expect_err("no documents");
        assert!(matches!(err, WorkspaceSetupError::InvalidInput(_)));

        let mut blank_title = inputs(&["a.pdf"]);
        blank_title.job.title = " ".to_string();
        let err = manager
            .create(&RunId::generate(), &blank_title, &definition())
            .expect_err("blank title");
        assert!(matches!(err, WorkspaceSetupError::InvalidInput(_)));
    }

    #[test]
    fn teardown_removes_the_tree() {
        let stages = stage_dir();
        let manager = WorkspaceManager::new(stages.path());
        let workspace = manager
            .create(&RunId::generate(), &inputs(&["alice.pdf"]), &definition())
            .expect("workspace builds");
        let root = workspace.root().to_path_buf();

        manager.teardown(workspace);

        assert!(!root.exists());
    }

    #[test]
    fn concurrent_workspaces_are_disjoint() {
        let stages = stage_dir();
        let manager = WorkspaceManager::new(stages.path());
        let first = manager
            .create(&RunId::generate(), &inputs(&["alice.pdf"]), &definition())
            .expect("first");
        let second = manager
            .create(&RunId::generate(), &inputs(&["bob.pdf"]), &definition())
            .expect("second");

        assert_ne!(first.root(), second.root());
        assert!(!second.candidates_dir().join("alice.pdf").exists());
        assert!(!first.candidates_dir().join("bob.pdf").exists());
    }
}
