use thiserror::Error;

use tg_core::{JobId, JobState};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Job {id} ended {state}: {reason}")]
    JobNotCompleted {
        id: JobId,
        state: JobState,
        reason: String,
    },

    #[error("Invalid --param '{0}', expected key=value")]
    InvalidParam(String),

    #[error("--strength requires --reference")]
    StrengthWithoutReference,
}
