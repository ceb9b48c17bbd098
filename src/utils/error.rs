use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("HTTP client error: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Malformed input: {message}")]
    MalformedInput { message: String },

    #[error("Endpoint resolution failed: {message}")]
    EndpointResolution { message: String },

    #[error("Payload path '{path}' collides with an existing value")]
    PayloadError { path: String },

    #[error("Checkpoint persistence failed for {path}: {source}")]
    PersistenceError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Input,
    Network,
    Persistence,
    Data,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn config(message: impl Into<String>) -> Self {
        EtlError::ConfigError {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ConfigError { .. }
            | EtlError::MissingConfigError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::EndpointResolution { .. } => ErrorCategory::Configuration,
            EtlError::CsvError(_) | EtlError::MalformedInput { .. } | EtlError::IoError(_) => {
                ErrorCategory::Input
            }
            EtlError::ApiError(_) => ErrorCategory::Network,
            EtlError::PersistenceError { .. } => ErrorCategory::Persistence,
            EtlError::PayloadError { .. } => ErrorCategory::Data,
            EtlError::SerializationError(_) => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Data => ErrorSeverity::Low,
            ErrorCategory::Network => ErrorSeverity::Medium,
            ErrorCategory::Configuration | ErrorCategory::Input => ErrorSeverity::High,
            ErrorCategory::Persistence | ErrorCategory::Internal => ErrorSeverity::Critical,
        }
    }

    /// 對應 CLI 的結束碼
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration => 1,
            ErrorCategory::Input | ErrorCategory::Persistence => 2,
            _ => 3,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            EtlError::MissingConfigError { .. } => "Add the missing field to the configuration file",
            EtlError::InvalidConfigValueError { .. } | EtlError::ConfigValidationError { .. } => {
                "Fix the reported configuration value and run again"
            }
            EtlError::EndpointResolution { .. } => {
                "Configure a default endpoint, an endpoint selector column, or pass --endpoint-name"
            }
            EtlError::MalformedInput { .. } | EtlError::CsvError(_) => {
                "Check that the input file has a header row and uses the configured delimiter"
            }
            EtlError::IoError(_) => "Check that the input file exists and is readable",
            EtlError::PersistenceError { .. } => {
                "Check permissions and free space for the checkpoint directory"
            }
            EtlError::ApiError(_) => "Check network connectivity and the endpoint URL",
            _ => "Re-run with --verbose for more details",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Input => format!("Could not read input: {}", self),
            ErrorCategory::Network => format!("Network problem: {}", self),
            ErrorCategory::Persistence => format!("Could not persist progress: {}", self),
            ErrorCategory::Data => format!("Data problem: {}", self),
            ErrorCategory::Internal => format!("Unexpected failure: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
