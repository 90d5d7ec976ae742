pub mod pool;

pub use pool::{TaskReport, WorkerPool};
