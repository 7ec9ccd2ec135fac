use crate::config::{expand_path, HandoffConfig};
use crate::elevation::{ElevatedProcess, ELEVATION_DECLINED_STATUS};
use crate::error::BootError;
use crate::fsutil::write_atomic_text_file;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub const SENTINEL_FILE_NAME: &str = "elevated.status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelRecord {
    pub status: i32,
    #[serde(default = "default_phase")]
    pub phase: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub finished_at: String,
}

fn default_phase() -> String {
    "elevated".to_string()
}

impl SentinelRecord {
    pub fn new(status: i32, run_id: Option<&str>) -> Self {
        Self {
            status,
            phase: default_phase(),
            run_id: run_id.map(str::to_string),
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn sentinel_base_dir(handoff: &HandoffConfig) -> PathBuf {
    let configured = handoff.sentinel_dir.trim();
    let base = if configured.is_empty() {
        env::temp_dir()
    } else {
        PathBuf::from(expand_path(configured))
    };
    base.join("wslboot")
}

pub fn default_sentinel_path(base: &Path) -> PathBuf {
    base.join(SENTINEL_FILE_NAME)
}

pub fn run_sentinel_path(base: &Path, run_id: &str) -> PathBuf {
    base.join(run_id).join(SENTINEL_FILE_NAME)
}

pub fn write_sentinel(path: &Path, record: &SentinelRecord) -> Result<(), BootError> {
    let mut content = serde_json::to_string(record)?;
    content.push('\n');
    write_atomic_text_file(path, &content)
}

pub fn parse_sentinel(content: &str) -> Result<SentinelRecord, BootError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(BootError::Protocol("sentinel file is empty".to_string()));
    }
    if let Ok(status) = trimmed.parse::<i32>() {
        return Ok(SentinelRecord {
            status,
            phase: default_phase(),
            run_id: None,
            finished_at: String::new(),
        });
    }
    serde_json::from_str(trimmed)
        .map_err(|err| BootError::Protocol(format!("sentinel content is not a status record: {err}")))
}

// A record with another run id was left by an earlier run.
pub fn read_sentinel(path: &Path, expected_run_id: Option<&str>) -> Result<SentinelRecord, BootError> {
    let content = fs::read_to_string(path)?;
    let record = parse_sentinel(&content).map_err(|err| match err {
        BootError::Protocol(message) => {
            BootError::Protocol(format!("{message} ({})", path.display()))
        }
        other => other,
    })?;
    if let (Some(expected), Some(found)) = (expected_run_id, record.run_id.as_deref()) {
        if expected != found {
            return Err(BootError::Protocol(format!(
                "stale sentinel at {}: run id {found}, expected {expected}",
                path.display()
            )));
        }
    }
    Ok(record)
}

pub fn remove_sentinel(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "sentinel removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove sentinel")
        }
    }
}

pub fn cleanup_run_sentinel(path: &Path) {
    remove_sentinel(path);
    if let Some(dir) = path.parent() {
        let _ = fs::remove_dir(dir);
    }
}

fn exit_without_sentinel(code: i32, path: &Path) -> BootError {
    match code {
        ELEVATION_DECLINED_STATUS => {
            BootError::Elevation("the elevation prompt was declined".to_string())
        }
        0 => BootError::Protocol(format!(
            "elevated phase exited successfully without writing {}",
            path.display()
        )),
        status => BootError::ElevatedFailed { status },
    }
}

pub fn wait_for_sentinel(
    path: &Path,
    child: &mut dyn ElevatedProcess,
    interval: Duration,
    timeout: Duration,
    expected_run_id: Option<&str>,
) -> Result<SentinelRecord, BootError> {
    let started = Instant::now();
    loop {
        if path.exists() {
            return read_sentinel(path, expected_run_id);
        }
        if let Some(code) = child.try_wait()? {
            // The record may land between the existence check and the exit.
            if path.exists() {
                return read_sentinel(path, expected_run_id);
            }
            return Err(exit_without_sentinel(code, path));
        }
        let waited = started.elapsed();
        if waited >= timeout {
            if let Err(err) = child.kill() {
                tracing::warn!(error = %err, "failed to terminate elevated phase");
            }
            return Err(BootError::Timeout {
                path: path.display().to_string(),
                waited_secs: waited.as_secs(),
            });
        }
        thread::sleep(interval.min(timeout - waited));
    }
}
