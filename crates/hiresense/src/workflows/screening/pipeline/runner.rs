use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::launch::{launch, CancellationFlag, LaunchContext, LaunchError};
use super::stage::{PipelineDefinition, Stage};
use crate::config::{BackendToggle, PipelineConfig};
use crate::workflows::screening::domain::StageExecution;

/// Settings applied uniformly to every stage launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    pub backend: BackendToggle,
    pub extra_env: BTreeMap<String, String>,
    pub inherit_env: bool,
    pub timeout: Option<Duration>,
}

impl LaunchSettings {
    pub fn new(backend: BackendToggle) -> Self {
        Self {
            backend,
            extra_env: BTreeMap::new(),
            inherit_env: true,
            timeout: None,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            timeout: config.stage_timeout,
            ..Self::new(config.backend_toggle.clone())
        }
    }
}

/// Progress of a run through its stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    Running { stage_index: usize },
    Failed { stage_index: usize },
    Completed,
}

/// Outcome of a pipeline in which every stage exited successfully.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub state: RunnerState,
    pub executions: Vec<StageExecution>,
}

/// Why a stage aborted the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailureReason {
    NonZeroExit(Option<i32>),
    LaunchFailed(String),
    TimedOut(Duration),
    Cancelled,
}

impl fmt::Display for StageFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailureReason::NonZeroExit(Some(code)) => write!(f, "exited with status {code}"),
            StageFailureReason::NonZeroExit(None) => write!(f, "terminated by a signal"),
            StageFailureReason::LaunchFailed(detail) => {
                write!(f, "could not be launched: {detail}")
            }
            StageFailureReason::TimedOut(limit) => {
                write!(f, "exceeded the {}s time limit", limit.as_secs_f64())
            }
            StageFailureReason::Cancelled => write!(f, "was cancelled"),
        }
    }
}

/// A stage did not complete successfully; carries its captured output.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stage `{stage}` {reason}")]
pub struct StageExecutionError {
    pub stage: String,
    pub stage_index: usize,
    pub reason: StageFailureReason,
    pub stdout: String,
    pub stderr: String,
    /// Log of every stage that ran, the failing one last.
    pub executions: Vec<StageExecution>,
}

impl StageExecutionError {
    pub fn is_cancellation(&self) -> bool {
        self.reason == StageFailureReason::Cancelled
    }
}

/// Runs configured stages one after another inside a workspace.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    settings: LaunchSettings,
}

impl PipelineRunner {
    pub fn new(settings: LaunchSettings) -> Self {
        Self { settings }
    }

    /// Resolves how `stage` is started inside `workspace`.
    pub fn launch_context(&self, stage: &Stage, workspace: &Path) -> LaunchContext {
        let staged = workspace.join(stage.staged_name().unwrap_or(stage.executable.as_os_str()));
        let staged = staged.to_string_lossy().into_owned();

        let (program, mut args) = match &stage.interpreter {
            Some(interpreter) => (interpreter.clone(), vec![staged]),
            None => (staged, Vec::new()),
        };
        args.extend(stage.args.iter().cloned());

        let mut env = self.settings.extra_env.clone();
        env.insert(
            self.settings.backend.key.clone(),
            self.settings.backend.value.clone(),
        );

        LaunchContext {
            program,
            args,
            working_dir: stage.working_dir.resolve(workspace),
            env,
            inherit_env: self.settings.inherit_env,
            timeout: self.settings.timeout,
        }
    }

    /// Executes every stage in order, stopping at the first one that does not succeed.
    pub fn execute(
        &self,
        definition: &PipelineDefinition,
        workspace: &Path,
        cancel: &CancellationFlag,
    ) -> Result<RunResult, StageExecutionError> {
        let mut state = RunnerState::NotStarted;
        let mut executions = Vec::with_capacity(definition.len());

        for (stage_index, stage) in definition.stages().iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StageExecutionError {
                    stage: stage.name.clone(),
                    stage_index,
                    reason: StageFailureReason::Cancelled,
                    stdout: String::new(),
                    stderr: String::new(),
                    executions,
                });
            }

            state = RunnerState::Running { stage_index };
            info!(stage = %stage.name, stage_index, ?state, "launching stage");

            let context = self.launch_context(stage, workspace);
            let (execution, reason) = run_stage(stage, &context, cancel);
            executions.push(execution.clone());

            if let Some(reason) = reason {
                state = RunnerState::Failed { stage_index };
                warn!(stage = %stage.name, %reason, ?state, "stage failed, aborting run");
                return Err(StageExecutionError {
                    stage: stage.name.clone(),
                    stage_index,
                    reason,
                    stdout: execution.stdout,
                    stderr: execution.stderr,
                    executions,
                });
            }

            info!(
                stage = %stage.name,
                duration_ms = execution.duration_ms,
                "stage completed"
            );
            if !workspace.join(&stage.artifact).exists() {
                warn!(
                    stage = %stage.name,
                    artifact = %stage.artifact,
                    "stage succeeded without producing its artifact"
                );
            }
        }

        if matches!(state, RunnerState::Running { .. }) {
            state = RunnerState::Completed;
        }

        Ok(RunResult { state, executions })
    }
}

fn run_stage(
    stage: &Stage,
    context: &LaunchContext,
    cancel: &CancellationFlag,
) -> (StageExecution, Option<StageFailureReason>) {
    let mut execution = StageExecution {
        stage: stage.name.clone(),
        exit_code: None,
        success: false,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: 0,
    };

    let reason = match launch(context, cancel) {
        Ok(output) => {
            execution.exit_code = output.status.code();
            execution.success = output.status.success();
            execution.stdout = output.stdout;
            execution.stderr = output.stderr;
            execution.duration_ms = duration_ms(output.elapsed);
            (!execution.success).then_some(StageFailureReason::NonZeroExit(execution.exit_code))
        }
        Err(LaunchError::Spawn(err)) => Some(StageFailureReason::LaunchFailed(format!(
            "{}: {}",
            context.program, err
        ))),
        Err(LaunchError::Wait(err)) => Some(StageFailureReason::LaunchFailed(err.to_string())),
        Err(LaunchError::TimedOut { stdout, stderr }) => {
            execution.stdout = stdout;
            execution.stderr = stderr;
            context.timeout.map(StageFailureReason::TimedOut)
        }
        Err(LaunchError::Cancelled { stdout, stderr }) => {
            execution.stdout = stdout;
            execution.stderr = stderr;
            Some(StageFailureReason::Cancelled)
        }
    };

    (execution, reason)
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
