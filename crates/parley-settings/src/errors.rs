//! Settings error types.

use thiserror::Error;

/// Failures loading or interpreting settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value parsed but cannot be used (bad template, zero limit, ...).
    #[error("invalid settings value for {field}: {message}")]
    InvalidValue {
        /// Dotted settings path.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// Settings result alias.
pub type Result<T> = std::result::Result<T, SettingsError>;
