pub mod error;
pub mod models;
pub mod orchestrator;
pub mod path_group;
pub mod progress;
pub mod retry;
pub mod transfer_engine;

pub use error::{ErrorKind, LockedError, TransferError};
pub use models::{
    Action, CandidateFile, Direction, ResultSummary, TransferRequest, TransferResult,
};
pub use orchestrator::Orchestrator;
pub use path_group::PathGroupProcessor;
pub use progress::ProgressTracker;
pub use retry::{RecordingSleeper, RetryError, RetryPolicy, Sleeper, TokioSleeper, retry};
pub use transfer_engine::{FileTransfer, TransferEngine};
