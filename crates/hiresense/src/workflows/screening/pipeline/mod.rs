mod launch;
mod runner;
mod stage;

pub use launch::{CancellationFlag, LaunchContext};
pub use runner::{
    LaunchSettings, PipelineRunner, RunResult, RunnerState, StageExecutionError,
    StageFailureReason,
};
pub use stage::{PipelineDefinition, PipelineDefinitionError, Stage, StageRole, WorkingDirectory};
