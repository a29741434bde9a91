use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Startup-only failure: an artifact is missing or unreadable.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("artifact not found: {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Camera failure. Ends the current video session only.
    #[error("device error: {0}")]
    Device(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("row {row}, column {column}: invalid value {value:?}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },
    #[error("expected {expected} values, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("channel {0} is not a finite number")]
    NonFinite(String),
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error("channel {0} given more than once")]
    DuplicateChannel(String),
    #[error("{channel}={value} is outside [{min}, {max}]")]
    OutOfRange {
        channel: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl Error {
    /// True for errors that must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::ArtifactMissing(_))
    }
}

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Error::Inference(e.to_string())
    }
}

impl From<nokhwa::NokhwaError> for Error {
    fn from(e: nokhwa::NokhwaError) -> Self {
        Error::Device(e.to_string())
    }
}
