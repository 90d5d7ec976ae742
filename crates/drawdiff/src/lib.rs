pub mod config;
pub mod db;
pub mod drawings;
pub mod error;
pub mod imaging;
pub mod manual_overlay;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod stage;
pub mod storage;
pub mod summary;
pub mod telemetry;
pub mod worker;

pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use error::{
    AlignError, ConfigError, DecodeError, DrawdiffError, Result, StorageError, WorkerError,
};
pub use orchestrator::{Job, JobError, JobStatus, JobView, NewJob, Orchestrator};
pub use pipeline::{DiffResult, StageRunner, StageTask, TaskOutcome};
pub use queue::StageQueue;
pub use stage::{Stage, StageKind, StageMachine, StageStatus};
pub use storage::{FileStorage, ObjectStore};
pub use worker::WorkerPool;
