use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// What a stage contributes to the run. The aggregator reads artifacts by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Preparation,
    Grading,
    PersonaFit,
    Bias,
    Explanation,
    Feedback,
    Persistence,
}

impl StageRole {
    /// Roles that may appear at most once in a pipeline.
    fn is_unique(&self) -> bool {
        matches!(
            self,
            StageRole::Grading | StageRole::PersonaFit | StageRole::Bias | StageRole::Explanation
        )
    }
}

/// Directory a stage process is started in, relative to the run workspace.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkingDirectory {
    #[default]
    WorkspaceRoot,
    Subdirectory(PathBuf),
}

impl WorkingDirectory {
    pub fn resolve(&self, workspace: &Path) -> PathBuf {
        match self {
            WorkingDirectory::WorkspaceRoot => workspace.to_path_buf(),
            WorkingDirectory::Subdirectory(relative) => workspace.join(relative),
        }
    }
}

/// Immutable description of one external screening step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub role: StageRole,
    /// File name of the executable inside the stage directory; it is staged into the
    /// workspace root under the same name.
    pub executable: PathBuf,
    /// Program that runs the staged executable. `None` executes it directly.
    pub interpreter: Option<String>,
    pub args: Vec<String>,
    pub working_dir: WorkingDirectory,
    /// Tabular artifact the stage writes into the workspace root.
    pub artifact: String,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        role: StageRole,
        executable: impl Into<PathBuf>,
        artifact: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            executable: executable.into(),
            interpreter: None,
            args: Vec::new(),
            working_dir: WorkingDirectory::WorkspaceRoot,
            artifact: artifact.into(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_directory(mut self, working_dir: WorkingDirectory) -> Self {
        self.working_dir = working_dir;
        self
    }

    /// Name the executable carries once staged into the workspace.
    pub fn staged_name(&self) -> Option<&std::ffi::OsStr> {
        self.executable.file_name()
    }
}

/// Ordered, validated stage list for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
    stages: Vec<Stage>,
}

impl PipelineDefinition {
    pub fn new(stages: Vec<Stage>) -> Result<Self, PipelineDefinitionError> {
        if stages.is_empty() {
            return Err(PipelineDefinitionError::Empty);
        }

        let mut names = HashSet::new();
        let mut roles = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(PipelineDefinitionError::UnnamedStage);
            }
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineDefinitionError::DuplicateStage(stage.name.clone()));
            }
            if stage.staged_name().is_none() {
                return Err(PipelineDefinitionError::InvalidExecutable(stage.name.clone()));
            }
            if stage.role.is_unique() && !roles.insert(stage.role) {
                return Err(PipelineDefinitionError::DuplicateRole(stage.role));
            }
        }

        if !roles.contains(&StageRole::Grading) {
            return Err(PipelineDefinitionError::MissingGradingStage);
        }

        Ok(Self { stages })
    }

    /// The HireSense stage order, each script launched through `interpreter`.
    pub fn hiresense(interpreter: &str) -> Self {
        const STAGES: &[(&str, StageRole, &str, &str)] = &[
            (
                "jd_optimizer",
                StageRole::Preparation,
                "jd_optimizer.py",
                "optimized_jds.csv",
            ),
            (
                "cv_grader",
                StageRole::Grading,
                "cv_grader.py",
                "cv_grading_results.csv",
            ),
            (
                "bias_agent",
                StageRole::Bias,
                "bias_agent.py",
                "cv_bias_fairness.csv",
            ),
            (
                "persona_agent",
                StageRole::PersonaFit,
                "persona_agent.py",
                "persona_fit_results.csv",
            ),
            (
                "explainability_agent",
                StageRole::Explanation,
                "explainability_agent.py",
                "explainability_results.csv",
            ),
            (
                "feedback_agent",
                StageRole::Feedback,
                "feedback_agent.py",
                "feedback_adjusted_results.csv",
            ),
            (
                "sql_agent",
                StageRole::Persistence,
                "sql_agent.py",
                "memory.db",
            ),
        ];

        let stages = STAGES
            .iter()
            .map(|(name, role, script, artifact)| {
                Stage::new(*name, *role, *script, *artifact).with_interpreter(interpreter)
            })
            .collect();

        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_for(&self, role: StageRole) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.role == role)
    }

    pub fn artifact_for(&self, role: StageRole) -> Option<&str> {
        self.stage_for(role).map(|stage| stage.artifact.as_str())
    }

    /// Artifacts of persistence stages, which are carried across runs.
    pub fn persisted_artifacts(&self) -> impl Iterator<Item = &str> {
        self.stages
            .iter()
            .filter(|stage| stage.role == StageRole::Persistence)
            .map(|stage| stage.artifact.as_str())
    }

    /// Whether `name` is written fresh by a non-persistence stage on every run.
    pub fn is_run_output(&self, name: &str) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.role != StageRole::Persistence && stage.artifact == name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineDefinitionError {
    #[error("pipeline must contain at least one stage")]
    Empty,
    #[error("every stage needs a name")]
    UnnamedStage,
    #[error("stage `{0}` is configured more than once")]
    DuplicateStage(String),
    #[error("stage `{0}` has no executable file name")]
    InvalidExecutable(String),
    #[error("only one stage may have the {0:?} role")]
    DuplicateRole(StageRole),
    #[error("pipeline has no grading stage to anchor aggregation")]
    MissingGradingStage,
}
