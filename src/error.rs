//! Error types for flowforge operations.
//!
//! Defines error types for the major subsystems:
//! - Configuration graph loading and validation
//! - Dataset storage, conversion and export
//! - Worker HTTP communication
//! - Process orchestration (lifecycle, scheduling, callbacks)
//!
//! Every error carries a stable machine-readable code (`code()`) next to its
//! human-readable message, and classifies into one of four categories
//! (`ErrorClass`): user-state errors are reported synchronously and never
//! retried, external-request errors move the affected process to ERROR,
//! internal errors indicate a configuration or programming defect, and data
//! errors are caught per job.

use thiserror::Error;
use uuid::Uuid;

/// Broad classification of an error, driving how it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad request from the caller; reported synchronously, never retried.
    User,
    /// Failure talking to an external worker; the process transitions to ERROR.
    External,
    /// Invariant violation or defect; surfaced as a server-side error.
    Internal,
    /// Malformed payload or undecodable value; contained to the affected job.
    Data,
}

/// Errors that can occur while loading or validating the configuration graph.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Job '{job}' references unknown server '{server}'")]
    UnknownServer { job: String, server: String },

    #[error("Duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Invalid column name '{0}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidColumnName(String),

    #[error("Server '{0}' declares no instances")]
    NoInstances(String),

    #[error("Endpoint template '{template}' for job '{job}' is missing the '{placeholder}' placeholder")]
    MissingPlaceholder {
        job: String,
        template: String,
        placeholder: &'static str,
    },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Errors that can occur in the dataset layer (schema, store, export).
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Hold-out percentage must lie in [0, 1], got {0}")]
    InvalidPercentage(f64),

    #[error("Unknown columns: {0}")]
    UnknownColumns(String),

    #[error("Column '{0}' has an undefined data type")]
    UndefinedType(String),

    #[error("Dataset {0} has no stored data")]
    NoStoredData(i64),

    #[error("Dataset {0} is confirmed and may only be deleted, never overwritten")]
    Confirmed(i64),

    #[error("Row has {actual} cells but the schema declares {expected} columns")]
    RowWidthMismatch { expected: usize, actual: usize },

    #[error("Cell at row {row}, column {column} is not a valid {expected}: {value}")]
    CellType {
        row: usize,
        column: usize,
        expected: &'static str,
        value: String,
    },

    #[error("Page numbers are 1-based, got page {0}")]
    InvalidPage(usize),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors that can occur while talking to an external worker instance.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Request to worker timed out: {0}")]
    Timeout(String),

    #[error("Worker rejected the request ({code}): {message}")]
    ErrorBody { code: String, message: String },

    #[error("Worker returned status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Request to worker failed: {0}")]
    Request(String),

    #[error("Invalid response from worker: {0}")]
    InvalidResponse(String),
}

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No process found for correlation id {0}")]
    NoSuchProcess(Uuid),

    #[error("Project {0} not found")]
    ProjectNotFound(Uuid),

    #[error("Stage '{0}' not found")]
    StageNotFound(String),

    #[error("Job '{job}' not found in stage '{stage}'")]
    JobNotFound { stage: String, job: String },

    #[error("Stage '{stage}' is {status} and cannot accept this request")]
    InvalidStageState { stage: String, status: String },

    #[error("Job '{0}' has not been configured")]
    JobNotConfigured(String),

    #[error("Preceding job '{0}' has not finished or been skipped")]
    PrecedingJobUnfinished(String),

    #[error("No source dataset available for job '{0}'")]
    NoSourceDataset(String),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Malformed result payload for part '{part}': {detail}")]
    MalformedPayload { part: String, detail: String },

    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns the stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NoSuchProcess(_) => "NO_SUCH_PROCESS",
            EngineError::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            EngineError::StageNotFound(_) => "STAGE_NOT_FOUND",
            EngineError::JobNotFound { .. } => "JOB_NOT_FOUND",
            EngineError::InvalidStageState { .. } => "INVALID_STAGE_STATE",
            EngineError::JobNotConfigured(_) => "JOB_NOT_CONFIGURED",
            EngineError::PrecedingJobUnfinished(_) => "PRECEDING_JOB_UNFINISHED",
            EngineError::NoSourceDataset(_) => "NO_SOURCE_DATASET",
            EngineError::Dataset(e) => e.code(),
            EngineError::Worker(_) => "WORKER_REQUEST_FAILED",
            EngineError::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            EngineError::Internal(_) => "INTERNAL",
        }
    }

    /// Returns the broad classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::NoSuchProcess(_)
            | EngineError::ProjectNotFound(_)
            | EngineError::StageNotFound(_)
            | EngineError::JobNotFound { .. }
            | EngineError::InvalidStageState { .. }
            | EngineError::JobNotConfigured(_)
            | EngineError::PrecedingJobUnfinished(_) => ErrorClass::User,
            EngineError::Worker(_) => ErrorClass::External,
            EngineError::MalformedPayload { .. } => ErrorClass::Data,
            EngineError::Dataset(e) => e.class(),
            EngineError::NoSourceDataset(_) | EngineError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether this error should be reported to the caller as a bad request.
    pub fn is_user_error(&self) -> bool {
        self.class() == ErrorClass::User
    }
}

impl DatasetError {
    /// Returns the stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            DatasetError::InvalidPercentage(_) => "INVALID_PERCENTAGE",
            DatasetError::UnknownColumns(_) => "UNKNOWN_COLUMNS",
            DatasetError::UndefinedType(_) => "UNDEFINED_TYPE",
            DatasetError::NoStoredData(_) => "NO_STORED_DATA",
            DatasetError::Confirmed(_) => "DATASET_CONFIRMED",
            DatasetError::RowWidthMismatch { .. } => "ROW_WIDTH_MISMATCH",
            DatasetError::CellType { .. } => "CELL_TYPE",
            DatasetError::InvalidPage(_) => "INVALID_PAGE",
            DatasetError::Database(_) => "DATABASE",
        }
    }

    /// Returns the broad classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            DatasetError::InvalidPercentage(_)
            | DatasetError::UnknownColumns(_)
            | DatasetError::Confirmed(_)
            | DatasetError::InvalidPage(_) => ErrorClass::User,
            DatasetError::UndefinedType(_) | DatasetError::NoStoredData(_) => ErrorClass::Internal,
            DatasetError::RowWidthMismatch { .. } | DatasetError::CellType { .. } => {
                ErrorClass::Data
            }
            DatasetError::Database(_) => ErrorClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_classify_as_user() {
        let err = EngineError::JobNotConfigured("synthesis".to_string());
        assert_eq!(err.class(), ErrorClass::User);
        assert!(err.is_user_error());
        assert_eq!(err.code(), "JOB_NOT_CONFIGURED");
    }

    #[test]
    fn test_worker_errors_classify_as_external() {
        let err = EngineError::Worker(WorkerError::Timeout("connect".to_string()));
        assert_eq!(err.class(), ErrorClass::External);
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_dataset_error_codes_propagate() {
        let err = EngineError::Dataset(DatasetError::InvalidPercentage(1.5));
        assert_eq!(err.code(), "INVALID_PERCENTAGE");
        assert!(err.is_user_error());
    }

    #[test]
    fn test_unknown_columns_message_lists_names() {
        let err = DatasetError::UnknownColumns("age, zip".to_string());
        assert!(err.to_string().contains("age, zip"));
    }
}
