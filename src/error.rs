//! Error types shared by every stage of the solar pipeline.

use thiserror::Error;

/// Errors produced by the solar potential engine.
///
/// A cancelled run is not an error; it is reported through
/// [`crate::progress::Completion::Cancelled`].
#[derive(Error, Debug)]
pub enum SolarError {
    #[error("data format error: {message}")]
    DataFormat {
        line: Option<usize>,
        message: String,
    },

    #[error("grid '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invalid parameter '{name}' = {value}: {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("geoprocessing engine error: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SolarError {
    pub(crate) fn data_format(line: Option<usize>, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = match line {
            Some(l) => format!("line {l}: {message}"),
            None => message,
        };
        SolarError::DataFormat { line, message }
    }

    pub(crate) fn invalid(
        name: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        SolarError::InvalidParameter {
            name: name.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for SolarError {
    fn from(err: toml::de::Error) -> Self {
        SolarError::Config(err.to_string())
    }
}

#[cfg(feature = "python")]
impl From<SolarError> for pyo3::PyErr {
    fn from(err: SolarError) -> Self {
        match err {
            SolarError::Io(e) => pyo3::exceptions::PyIOError::new_err(e.to_string()),
            other => pyo3::exceptions::PyValueError::new_err(other.to_string()),
        }
    }
}

/// Result alias for solar engine operations.
pub type Result<T> = std::result::Result<T, SolarError>;
