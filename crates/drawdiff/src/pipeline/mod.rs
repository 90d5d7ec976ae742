//! Stage execution.

pub mod error;
pub mod handlers;
pub mod output;
pub mod progress;
pub mod runner;
pub mod task;

pub use error::PipelineError;
pub use handlers::{KeypointComparator, PageComparator, StageContext};
pub use output::{DiffResult, StageOutput};
pub use progress::{BroadcastProgress, NoopProgress, ProgressEvent, ProgressReporter, StagePhase};
pub use runner::{StageRunner, TaskOutcome};
pub use task::StageTask;
