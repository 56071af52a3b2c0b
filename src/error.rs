// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::sample::SampleState;

/// Everything that can go wrong while clustering a sample.
///
/// Errors are scoped to one sample: the orchestrator records them in the
/// run report and keeps going with the remaining samples.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no similarity-search output found for sample {sample} ({path})")]
    MissingHits { sample: String, path: PathBuf },

    #[error("similarity-search output exists but is empty for sample {sample} ({path})")]
    EmptyHits { sample: String, path: PathBuf },

    #[error("read {read} referenced by the search output is absent from the dereplicated reads of {sample}")]
    UnknownRead { sample: String, read: String },

    #[error("malformed record in {file} at line {line}: {message}")]
    Parse {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{tool} failed running `{command}`\nSTDERR: {stderr}\nSTDOUT: {stdout}")]
    ExternalTool {
        tool: String,
        command: String,
        stderr: String,
        stdout: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sample {sample} cannot move from {from:?} back to {to:?} without a forced re-run")]
    StateRegression {
        sample: String,
        from: SampleState,
        to: SampleState,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ClusterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(file: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    /// True for failures that only concern a single sample's inputs.
    pub fn is_sample_local(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

/// Attach a path to a bare `io::Error`.
pub trait IoContext<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| ClusterError::io(path, e))
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
