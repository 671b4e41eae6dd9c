//! Application-level error type shared across binaries and services.

use thiserror::Error;

use crate::config;
use crate::services::{
    BatchStoreError, ExtractError, IntakeError, ProcessorError, StorageError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error(transparent)]
    Batch(#[from] BatchStoreError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Provider(#[from] ExtractError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
