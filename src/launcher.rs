use crate::config::Config;
use crate::elevation::Elevator;
use crate::error::BootError;
use crate::runner::CommandRunner;
use crate::sentinel::{
    cleanup_run_sentinel, default_sentinel_path, remove_sentinel, run_sentinel_path,
    sentinel_base_dir, wait_for_sentinel, write_sentinel, SentinelRecord,
};
use crate::steps::{elevated_steps, run_phase, user_steps, Host, Phase, PhaseReport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub elevated_phase: bool,
    pub detach: bool,
    pub sentinel_path: Option<PathBuf>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    InProcess,
    Handoff,
    Detached,
    ElevatedOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentinel_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevated_status: Option<i32>,
    pub phases: Vec<PhaseReport>,
    pub restart_required: bool,
}

impl RunSummary {
    fn new(run_id: String, mode: RunMode) -> Self {
        Self {
            run_id,
            mode,
            sentinel_path: None,
            elevated_status: None,
            phases: Vec::new(),
            restart_required: false,
        }
    }

    fn push(&mut self, report: PhaseReport) {
        self.restart_required |= report.restart_required();
        self.phases.push(report);
    }

    pub fn status(&self) -> i32 {
        self.phases
            .iter()
            .map(PhaseReport::status)
            .max()
            .unwrap_or(0)
    }
}

pub fn new_run_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        std::process::id()
    )
}

pub struct Launcher<'a, R: CommandRunner, E: Elevator> {
    cfg: &'a Config,
    config_path: &'a Path,
    runner: &'a R,
    elevator: &'a E,
    poll_interval: Duration,
    timeout: Duration,
}

impl<'a, R: CommandRunner, E: Elevator> Launcher<'a, R, E> {
    pub fn new(cfg: &'a Config, config_path: &'a Path, runner: &'a R, elevator: &'a E) -> Self {
        Self {
            cfg,
            config_path,
            runner,
            elevator,
            poll_interval: cfg.handoff.poll_interval(),
            timeout: cfg.handoff.timeout(),
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    fn host(&self) -> Host<'a, R> {
        Host::new(self.cfg, self.runner)
    }

    pub fn run(&self, opts: &RunOptions) -> Result<RunSummary, BootError> {
        let run_id = opts.run_id.clone().unwrap_or_else(new_run_id);
        if opts.dry_run {
            return Ok(self.plan(run_id, opts.elevated_phase));
        }
        if opts.elevated_phase {
            let path = opts
                .sentinel_path
                .clone()
                .unwrap_or_else(|| default_sentinel_path(&sentinel_base_dir(&self.cfg.handoff)));
            return self.run_elevated(run_id, path);
        }
        if self.elevator.is_elevated() {
            return Ok(self.run_in_process(run_id));
        }
        self.run_handoff(run_id, opts.sentinel_path.clone(), opts.detach)
    }

    pub fn plan(&self, run_id: String, elevated_only: bool) -> RunSummary {
        let host = self.host();
        let mut summary = RunSummary::new(run_id, RunMode::DryRun);
        summary.push(run_phase(
            Phase::Elevated,
            &elevated_steps(self.cfg),
            &host,
            true,
        ));
        if !elevated_only {
            summary.push(run_phase(Phase::User, &user_steps(self.cfg), &host, true));
        }
        summary
    }

    pub fn run_elevated(&self, run_id: String, path: PathBuf) -> Result<RunSummary, BootError> {
        if !self.elevator.is_elevated() {
            return Err(BootError::Elevation(
                "the elevated phase must run with administrator rights".to_string(),
            ));
        }
        let report = run_phase(
            Phase::Elevated,
            &elevated_steps(self.cfg),
            &self.host(),
            false,
        );
        let record = SentinelRecord::new(report.status(), Some(run_id.as_str()));
        if let Err(err) = write_sentinel(&path, &record) {
            tracing::error!(path = %path.display(), error = %err, "failed to write sentinel");
            return Err(err);
        }
        tracing::info!(path = %path.display(), status = record.status, "elevated phase finished");
        let mut summary = RunSummary::new(run_id, RunMode::ElevatedOnly);
        summary.sentinel_path = Some(path);
        summary.elevated_status = Some(record.status);
        summary.push(report);
        Ok(summary)
    }

    fn run_in_process(&self, run_id: String) -> RunSummary {
        let host = self.host();
        let mut summary = RunSummary::new(run_id, RunMode::InProcess);
        let elevated = run_phase(Phase::Elevated, &elevated_steps(self.cfg), &host, false);
        let status = elevated.status();
        summary.elevated_status = Some(status);
        summary.push(elevated);
        if status != 0 {
            tracing::error!(status, "elevated phase did not converge; skipping user phase");
            return summary;
        }
        summary.push(self.run_user_phase());
        summary
    }

    pub fn run_user_phase(&self) -> PhaseReport {
        run_phase(Phase::User, &user_steps(self.cfg), &self.host(), false)
    }

    pub fn elevated_args(&self, run_id: &str, sentinel_path: &Path) -> Vec<String> {
        vec![
            "--config".to_string(),
            self.config_path.to_string_lossy().to_string(),
            "apply".to_string(),
            "--elevated-phase".to_string(),
            "--yes".to_string(),
            "--run-id".to_string(),
            run_id.to_string(),
            "--sentinel-path".to_string(),
            sentinel_path.to_string_lossy().to_string(),
        ]
    }

    fn run_handoff(
        &self,
        run_id: String,
        sentinel_path: Option<PathBuf>,
        detach: bool,
    ) -> Result<RunSummary, BootError> {
        // A caller-supplied path is cleaned as a file only; its directory is not ours.
        let owned_dir = sentinel_path.is_none();
        let path = sentinel_path
            .unwrap_or_else(|| run_sentinel_path(&sentinel_base_dir(&self.cfg.handoff), &run_id));
        remove_sentinel(&path);
        let mut child = self
            .elevator
            .spawn_elevated(&self.elevated_args(&run_id, &path))?;

        if detach {
            tracing::info!(path = %path.display(), "elevated phase started; not waiting");
            let mut summary = RunSummary::new(run_id, RunMode::Detached);
            summary.sentinel_path = Some(path);
            return Ok(summary);
        }

        tracing::info!(
            path = %path.display(),
            timeout_secs = self.timeout.as_secs(),
            "waiting for elevated phase"
        );
        let waited = wait_for_sentinel(
            &path,
            child.as_mut(),
            self.poll_interval,
            self.timeout,
            Some(run_id.as_str()),
        );
        if owned_dir {
            cleanup_run_sentinel(&path);
        } else {
            remove_sentinel(&path);
        }
        let record = waited?;
        if record.status != 0 {
            return Err(BootError::ElevatedFailed {
                status: record.status,
            });
        }

        let mut summary = RunSummary::new(run_id, RunMode::Handoff);
        summary.elevated_status = Some(record.status);
        summary.push(self.run_user_phase());
        Ok(summary)
    }
}
