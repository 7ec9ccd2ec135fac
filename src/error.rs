use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("elevation error: {0}")]
    Elevation(String),
    #[error("spawn error: {0}")]
    Spawn(String),
    #[error("timed out after {waited_secs}s waiting for elevated phase sentinel at {path}")]
    Timeout { path: String, waited_secs: u64 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("step {step} failed: {message}")]
    Step { step: String, message: String },
    #[error("elevated phase failed with status {status}")]
    ElevatedFailed { status: i32 },
}

impl BootError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ElevatedFailed { status } if *status != 0 => *status,
            _ => 1,
        }
    }

    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            Self::ProcessDetailed { details, .. } => Some(details.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}
