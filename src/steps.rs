use crate::config::Config;
use crate::download::with_downloaded_installer;
use crate::error::{BootError, ProcessErrorDetails};
use crate::runner::{render_command, CommandRunner};
use crate::settings::{apply_settings, pending_keys, read_settings};
use crate::tools::{
    apt_install_script, dism_enable_args, run_installer, wsl_set_default_version_args,
    ContainerEngine, Editor, WindowsFeatures, Wsl, DISM_PROGRAM, WSL_PROGRAM,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Elevated,
    User,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elevated => "elevated",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Converged,
    NotConverged(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    RestartRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    WindowsFeature { name: String },
    WslDefaultVersion { version: u8 },
    HostEngine,
    Distro,
    GuestPackages,
    GuestHelperScript,
    GuestShellLine,
    Editor,
    EditorExtension,
    EditorSettings,
    EngineMachineInit,
    EngineMachineStart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
}

impl Step {
    fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self { id: id.into(), kind }
    }
}

pub struct Host<'a, R: CommandRunner> {
    pub cfg: &'a Config,
    pub runner: &'a R,
}

impl<'a, R: CommandRunner> Host<'a, R> {
    pub fn new(cfg: &'a Config, runner: &'a R) -> Self {
        Self { cfg, runner }
    }

    fn features(&self) -> WindowsFeatures<'a, R> {
        WindowsFeatures::new(self.runner)
    }

    fn wsl(&self) -> Wsl<'a, R> {
        Wsl::new(self.runner, &self.cfg.distro.name)
    }

    fn engine(&self) -> ContainerEngine<'a, R> {
        ContainerEngine::new(self.runner, &self.cfg.host_engine.command)
    }

    fn editor(&self) -> Editor<'a, R> {
        Editor::new(self.runner, &self.cfg.editor.command)
    }
}

pub fn elevated_steps(cfg: &Config) -> Vec<Step> {
    let mut steps: Vec<Step> = cfg
        .windows
        .features
        .iter()
        .map(|name| {
            Step::new(
                format!("feature:{name}"),
                StepKind::WindowsFeature { name: name.clone() },
            )
        })
        .collect();
    steps.push(Step::new(
        "wsl-default-version",
        StepKind::WslDefaultVersion {
            version: cfg.windows.wsl_default_version,
        },
    ));
    if cfg.host_engine.enabled {
        steps.push(Step::new("host-engine", StepKind::HostEngine));
    }
    steps
}

pub fn user_steps(cfg: &Config) -> Vec<Step> {
    let mut steps = vec![Step::new("distro", StepKind::Distro)];
    if !cfg.guest.packages.is_empty() {
        steps.push(Step::new("guest-packages", StepKind::GuestPackages));
    }
    steps.push(Step::new("guest-helper-script", StepKind::GuestHelperScript));
    if !cfg.guest.shell_rc_line.trim().is_empty() {
        steps.push(Step::new("guest-shell-line", StepKind::GuestShellLine));
    }
    steps.push(Step::new("editor", StepKind::Editor));
    steps.push(Step::new("editor-extension", StepKind::EditorExtension));
    if !cfg.editor.settings.is_empty() {
        steps.push(Step::new("editor-settings", StepKind::EditorSettings));
    }
    if cfg.host_engine.enabled {
        steps.push(Step::new("engine-machine-init", StepKind::EngineMachineInit));
        steps.push(Step::new("engine-machine-start", StepKind::EngineMachineStart));
    }
    steps
}

fn converged_if(ok: bool, reason: impl Into<String>) -> Probe {
    if ok {
        Probe::Converged
    } else {
        Probe::NotConverged(reason.into())
    }
}

impl Step {
    pub fn describe(&self, cfg: &Config) -> String {
        match &self.kind {
            StepKind::WindowsFeature { name } => format!("Windows feature {name} enabled"),
            StepKind::WslDefaultVersion { version } => {
                format!("WSL default version is {version}")
            }
            StepKind::HostEngine => {
                format!("{} installed on the host", cfg.host_engine.command)
            }
            StepKind::Distro => format!("WSL distribution {} installed", cfg.distro.name),
            StepKind::GuestPackages => format!(
                "packages [{}] installed in {}",
                cfg.guest.packages.join(", "),
                cfg.distro.name
            ),
            StepKind::GuestHelperScript => format!(
                "helper script {} present in {}",
                cfg.guest.helper_script_path, cfg.distro.name
            ),
            StepKind::GuestShellLine => {
                format!("~/.bashrc in {} contains the engine line", cfg.distro.name)
            }
            StepKind::Editor => format!("editor `{}` installed", cfg.editor.command),
            StepKind::EditorExtension => {
                format!("editor extension {} installed", cfg.editor.extension)
            }
            StepKind::EditorSettings => format!(
                "editor settings {} set",
                cfg.editor
                    .settings
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            StepKind::EngineMachineInit => {
                format!("engine machine {} initialized", cfg.host_engine.machine_name)
            }
            StepKind::EngineMachineStart => {
                format!("engine machine {} running", cfg.host_engine.machine_name)
            }
        }
    }

    pub fn plan(&self, cfg: &Config) -> String {
        let distro = cfg.distro.name.as_str();
        let engine = cfg.host_engine.command.as_str();
        let machine = cfg.host_engine.machine_name.as_str();
        match &self.kind {
            StepKind::WindowsFeature { name } => format!(
                "run `{}`",
                render_command(DISM_PROGRAM, &dism_enable_args(name))
            ),
            StepKind::WslDefaultVersion { version } => format!(
                "run `{}`",
                render_command(WSL_PROGRAM, &wsl_set_default_version_args(*version))
            ),
            StepKind::HostEngine => format!(
                "download {} and run it with `{}`",
                cfg.host_engine.installer_url,
                cfg.host_engine.installer_args.join(" ")
            ),
            StepKind::Distro => format!("run `wsl --install -d {distro} --no-launch`"),
            StepKind::GuestPackages => format!(
                "run `{}` as root in {distro}",
                apt_install_script(&cfg.guest.packages)
            ),
            StepKind::GuestHelperScript => format!(
                "write {} ({} bytes, mode 0755) as root in {distro}",
                cfg.guest.helper_script_path,
                cfg.guest.helper_script.len()
            ),
            StepKind::GuestShellLine => format!(
                "append `{}` to ~/.bashrc in {distro}",
                cfg.guest.shell_rc_line
            ),
            StepKind::Editor => format!(
                "download {} and run it with `{}`",
                cfg.editor.installer_url,
                cfg.editor.installer_args.join(" ")
            ),
            StepKind::EditorExtension => format!(
                "run `{} --install-extension {}`",
                cfg.editor.command, cfg.editor.extension
            ),
            StepKind::EditorSettings => format!(
                "back up and patch {}",
                cfg.editor.resolved_settings_path().display()
            ),
            StepKind::EngineMachineInit => format!("run `{engine} machine init {machine}`"),
            StepKind::EngineMachineStart => format!("run `{engine} machine start {machine}`"),
        }
    }

    pub fn probe<R: CommandRunner>(&self, host: &Host<'_, R>) -> Result<Probe, BootError> {
        let cfg = host.cfg;
        let probe = match &self.kind {
            StepKind::WindowsFeature { name } => {
                converged_if(host.features().is_enabled(name)?, "feature is disabled")
            }
            StepKind::WslDefaultVersion { version } => {
                let current = host.wsl().default_version()?;
                converged_if(
                    current == Some(*version),
                    match current {
                        Some(found) => format!("default version is {found}"),
                        None => "default version is unknown".to_string(),
                    },
                )
            }
            StepKind::HostEngine => {
                converged_if(host.engine().is_installed()?, "engine CLI not found")
            }
            StepKind::Distro => {
                converged_if(host.wsl().has_distro()?, "distribution not registered")
            }
            StepKind::GuestPackages => {
                let missing = host.wsl().missing_packages(&cfg.guest.packages)?;
                converged_if(
                    missing.is_empty(),
                    format!("missing packages: {}", missing.join(", ")),
                )
            }
            StepKind::GuestHelperScript => converged_if(
                host.wsl()
                    .file_matches(&cfg.guest.helper_script_path, &cfg.guest.helper_script)?,
                "script missing, not executable, or out of date",
            ),
            StepKind::GuestShellLine => converged_if(
                host.wsl().has_shell_line(&cfg.guest.shell_rc_line)?,
                "line not present",
            ),
            StepKind::Editor => converged_if(host.editor().is_installed()?, "editor CLI not found"),
            StepKind::EditorExtension => converged_if(
                host.editor().has_extension(&cfg.editor.extension)?,
                "extension not installed",
            ),
            StepKind::EditorSettings => {
                let path = cfg.editor.resolved_settings_path();
                let pending = pending_keys(&read_settings(&path)?, &cfg.editor.settings);
                converged_if(
                    pending.is_empty(),
                    format!("keys differ: {}", pending.join(", ")),
                )
            }
            StepKind::EngineMachineInit => converged_if(
                host.engine().has_connection(&cfg.host_engine.machine_name)?,
                "no connection for machine",
            ),
            StepKind::EngineMachineStart => converged_if(
                host.engine().machine_running(&cfg.host_engine.machine_name)?,
                "machine not running",
            ),
        };
        Ok(probe)
    }

    pub fn apply<R: CommandRunner>(&self, host: &Host<'_, R>) -> Result<Applied, BootError> {
        let cfg = host.cfg;
        match &self.kind {
            StepKind::WindowsFeature { name } => {
                if host.features().enable(name)? {
                    return Ok(Applied::RestartRequired);
                }
            }
            StepKind::WslDefaultVersion { version } => {
                host.wsl().set_default_version(*version)?;
            }
            StepKind::HostEngine => {
                with_downloaded_installer(
                    &cfg.host_engine.installer_url,
                    "podman-setup.exe",
                    |installer| {
                        run_installer(host.runner, installer, &cfg.host_engine.installer_args)
                    },
                )?;
            }
            StepKind::Distro => host.wsl().install_distro()?,
            StepKind::GuestPackages => {
                let missing = host.wsl().missing_packages(&cfg.guest.packages)?;
                if !missing.is_empty() {
                    host.wsl().install_packages(&missing)?;
                }
            }
            StepKind::GuestHelperScript => host
                .wsl()
                .write_executable(&cfg.guest.helper_script_path, &cfg.guest.helper_script)?,
            StepKind::GuestShellLine => host.wsl().append_shell_line(&cfg.guest.shell_rc_line)?,
            StepKind::Editor => {
                with_downloaded_installer(
                    &cfg.editor.installer_url,
                    "VSCodeUserSetup.exe",
                    |installer| run_installer(host.runner, installer, &cfg.editor.installer_args),
                )?;
            }
            StepKind::EditorExtension => {
                host.editor().install_extension(&cfg.editor.extension)?
            }
            StepKind::EditorSettings => {
                let path = cfg.editor.resolved_settings_path();
                if let Some(backup) = apply_settings(&path, &cfg.editor.settings)? {
                    tracing::info!(backup = %backup.display(), "editor settings backed up");
                }
            }
            StepKind::EngineMachineInit => host
                .engine()
                .machine_init(&cfg.host_engine.machine_name)?,
            StepKind::EngineMachineStart => host
                .engine()
                .machine_start(&cfg.host_engine.machine_name)?,
        }
        Ok(Applied::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Converged,
    Applied,
    RestartRequired,
    Pending,
    Planned,
    Failed,
}

impl StepStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Converged => "ok",
            Self::Applied => "applied",
            Self::RestartRequired => "restart",
            Self::Pending => "pending",
            Self::Planned => "plan",
            Self::Failed => "fail",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub id: String,
    pub description: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub steps: Vec<StepOutcome>,
}

impl PhaseReport {
    pub fn status(&self) -> i32 {
        if self.steps.iter().any(|step| step.status == StepStatus::Failed) {
            1
        } else {
            0
        }
    }

    pub fn restart_required(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.status == StepStatus::RestartRequired)
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
    }

    pub fn first_failure(&self) -> Option<BootError> {
        self.failed().next().map(|step| BootError::Step {
            step: step.id.clone(),
            message: step.detail.clone().unwrap_or_default(),
        })
    }
}

fn failed_outcome(step: &Step, description: String, err: BootError) -> StepOutcome {
    StepOutcome {
        id: step.id.clone(),
        description,
        status: StepStatus::Failed,
        error_details: err.details(),
        detail: Some(err.to_string()),
    }
}

// A failing step is recorded and the fold carries on.
pub fn run_phase<R: CommandRunner>(
    phase: Phase,
    steps: &[Step],
    host: &Host<'_, R>,
    dry_run: bool,
) -> PhaseReport {
    let outcomes = steps.iter().fold(Vec::new(), |mut outcomes, step| {
        let description = step.describe(host.cfg);
        if dry_run {
            let plan = step.plan(host.cfg);
            tracing::info!(phase = phase.as_str(), step = %step.id, %plan, "dry-run");
            outcomes.push(StepOutcome {
                id: step.id.clone(),
                description,
                status: StepStatus::Planned,
                detail: Some(format!("if not converged: {plan}")),
                error_details: None,
            });
            return outcomes;
        }
        let outcome = match step.probe(host) {
            Ok(Probe::Converged) => {
                tracing::info!(phase = phase.as_str(), step = %step.id, "already converged");
                StepOutcome {
                    id: step.id.clone(),
                    description,
                    status: StepStatus::Converged,
                    detail: None,
                    error_details: None,
                }
            }
            Ok(Probe::NotConverged(reason)) => {
                tracing::info!(phase = phase.as_str(), step = %step.id, %reason, "converging");
                match step.apply(host) {
                    Ok(applied) => {
                        let status = match applied {
                            Applied::Done => StepStatus::Applied,
                            Applied::RestartRequired => {
                                tracing::warn!(step = %step.id, "restart required to finish");
                                StepStatus::RestartRequired
                            }
                        };
                        StepOutcome {
                            id: step.id.clone(),
                            description,
                            status,
                            detail: Some(reason),
                            error_details: None,
                        }
                    }
                    Err(err) => {
                        tracing::error!(phase = phase.as_str(), step = %step.id, error = %err, "step failed");
                        failed_outcome(step, description, err)
                    }
                }
            }
            Err(err) => {
                tracing::error!(phase = phase.as_str(), step = %step.id, error = %err, "probe failed");
                failed_outcome(step, description, err)
            }
        };
        outcomes.push(outcome);
        outcomes
    });
    PhaseReport {
        phase,
        steps: outcomes,
    }
}

pub fn survey_phase<R: CommandRunner>(
    phase: Phase,
    steps: &[Step],
    host: &Host<'_, R>,
) -> PhaseReport {
    let outcomes = steps
        .iter()
        .map(|step| {
            let description = step.describe(host.cfg);
            match step.probe(host) {
                Ok(Probe::Converged) => StepOutcome {
                    id: step.id.clone(),
                    description,
                    status: StepStatus::Converged,
                    detail: None,
                    error_details: None,
                },
                Ok(Probe::NotConverged(reason)) => StepOutcome {
                    id: step.id.clone(),
                    description,
                    status: StepStatus::Pending,
                    detail: Some(reason),
                    error_details: None,
                },
                Err(err) => failed_outcome(step, description, err),
            }
        })
        .collect();
    PhaseReport {
        phase,
        steps: outcomes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::{ok, status, MockRunner, RecordedCall};
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::io;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Default)]
    struct FakeHostState {
        features: BTreeSet<String>,
        default_version: Option<u8>,
        distros: Vec<String>,
        packages: BTreeSet<String>,
        files: Vec<(String, String)>,
        rc_lines: Vec<String>,
        editor_installed: bool,
        engine_installed: bool,
        extensions: Vec<String>,
        machines: Vec<String>,
        running: Vec<String>,
        mutations: Vec<String>,
    }

    fn fake_host(state: Rc<RefCell<FakeHostState>>) -> MockRunner {
        MockRunner::with(move |call: &RecordedCall| {
            let mut s = state.borrow_mut();
            let a: Vec<&str> = call.args.iter().map(String::as_str).collect();
            let program = call.program.as_str();
            let out = if program == "dism.exe" {
                let feature = a
                    .iter()
                    .find_map(|arg| arg.strip_prefix("/featurename:"))
                    .unwrap_or_default()
                    .to_string();
                if a.contains(&"/enable-feature") {
                    s.mutations.push(call.line());
                    s.features.insert(feature);
                    status(3010, "")
                } else if s.features.contains(&feature) {
                    ok("State : Enabled\n")
                } else {
                    ok("State : Disabled\n")
                }
            } else if program == "wsl" {
                match a.as_slice() {
                    ["--status"] => match s.default_version {
                        Some(v) => ok(&format!("Default Version: {v}\n")),
                        None => ok(""),
                    },
                    ["--set-default-version", v] => {
                        s.mutations.push(call.line());
                        s.default_version = v.parse().ok();
                        ok("")
                    }
                    ["--list", "--quiet"] => ok(&s.distros.join("\n")),
                    ["--install", "-d", name, "--no-launch"] => {
                        s.mutations.push(call.line());
                        s.distros.push(name.to_string());
                        ok("")
                    }
                    ["-d", _, "--exec", "dpkg-query", _, _, pkgs @ ..] => {
                        let listed: Vec<String> = pkgs
                            .iter()
                            .filter(|p| s.packages.contains(**p))
                            .map(|p| format!("{p} install ok installed"))
                            .collect();
                        ok(&listed.join("\n"))
                    }
                    ["-d", _, "--exec", "sh", "-c", script]
                    | ["-d", _, "-u", "root", "--exec", "sh", "-c", script] => {
                        let script = script.to_string();
                        if script.starts_with("apt-get") {
                            s.mutations.push(call.line());
                            let pkgs: Vec<String> = script
                                .rsplit("install -y ")
                                .next()
                                .unwrap_or_default()
                                .split_whitespace()
                                .map(str::to_string)
                                .collect();
                            s.packages.extend(pkgs);
                            ok("")
                        } else if script.starts_with("test -x") {
                            match s.files.first() {
                                Some((_, content)) => ok(content),
                                None => status(1, ""),
                            }
                        } else if script.starts_with("mkdir -p") {
                            s.mutations.push(call.line());
                            let content =
                                String::from_utf8_lossy(call.stdin.as_deref().unwrap_or_default())
                                    .to_string();
                            s.files = vec![("helper".to_string(), content)];
                            ok("")
                        } else if script.starts_with("grep") {
                            if s.rc_lines.is_empty() {
                                status(1, "")
                            } else {
                                ok("")
                            }
                        } else if script.starts_with("printf") {
                            s.mutations.push(call.line());
                            s.rc_lines.push(script);
                            ok("")
                        } else {
                            status(127, "unexpected script")
                        }
                    }
                    _ => status(2, "unexpected wsl call"),
                }
            } else if program.contains("podman") {
                match a.as_slice() {
                    ["--version"] if s.engine_installed => ok("podman version 5.0.0\n"),
                    ["--version"] => {
                        return Err(io::Error::new(io::ErrorKind::NotFound, "podman"));
                    }
                    ["system", "connection", "list", ..] => ok(&s.machines.join("\n")),
                    ["machine", "init", name] => {
                        s.mutations.push(call.line());
                        s.machines.push(name.to_string());
                        ok("")
                    }
                    ["machine", "inspect", name, ..] => {
                        if s.running.iter().any(|m| m == name) {
                            ok("running\n")
                        } else {
                            ok("stopped\n")
                        }
                    }
                    ["machine", "start", name] => {
                        s.mutations.push(call.line());
                        s.running.push(name.to_string());
                        ok("")
                    }
                    _ => status(125, "unexpected podman call"),
                }
            } else if program.contains("code") {
                match a.as_slice() {
                    ["--version"] if s.editor_installed => ok("1.90.0\n"),
                    ["--version"] => {
                        return Err(io::Error::new(io::ErrorKind::NotFound, "code"));
                    }
                    ["--list-extensions"] => ok(&s.extensions.join("\n")),
                    ["--install-extension", ext] => {
                        s.mutations.push(call.line());
                        s.extensions.push(ext.to_string());
                        ok("")
                    }
                    _ => status(1, "unexpected code call"),
                }
            } else {
                status(127, "unexpected program")
            };
            Ok(out)
        })
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.editor.settings_path = dir
            .path()
            .join("settings.json")
            .to_string_lossy()
            .to_string();
        cfg.editor.command = "code-wslboot-test".to_string();
        cfg.host_engine.command = "podman-wslboot-test".to_string();
        cfg
    }

    #[test]
    fn step_lists_follow_config() {
        let mut cfg = Config::default();
        let ids: Vec<String> = elevated_steps(&cfg).into_iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![
                "feature:Microsoft-Windows-Subsystem-Linux",
                "feature:VirtualMachinePlatform",
                "wsl-default-version"
            ]
        );
        cfg.host_engine.enabled = true;
        cfg.guest.shell_rc_line = String::new();
        let ids: Vec<String> = elevated_steps(&cfg).into_iter().map(|s| s.id).collect();
        assert_eq!(ids.last().map(String::as_str), Some("host-engine"));
        let ids: Vec<String> = user_steps(&cfg).into_iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![
                "distro",
                "guest-packages",
                "guest-helper-script",
                "editor",
                "editor-extension",
                "editor-settings",
                "engine-machine-init",
                "engine-machine-start"
            ]
        );
    }

    #[test]
    fn second_run_performs_no_mutations() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.host_engine.enabled = true;
        let state = Rc::new(RefCell::new(FakeHostState {
            editor_installed: true,
            engine_installed: true,
            ..FakeHostState::default()
        }));
        let runner = fake_host(state.clone());
        let host = Host::new(&cfg, &runner);

        let first_elevated = run_phase(Phase::Elevated, &elevated_steps(&cfg), &host, false);
        let first_user = run_phase(Phase::User, &user_steps(&cfg), &host, false);
        assert_eq!(first_elevated.status(), 0, "{first_elevated:?}");
        assert_eq!(first_user.status(), 0, "{first_user:?}");
        assert!(first_elevated.restart_required());
        let first_mutations = state.borrow().mutations.len();
        assert!(first_mutations >= 9, "{:?}", state.borrow().mutations);

        let second_elevated = run_phase(Phase::Elevated, &elevated_steps(&cfg), &host, false);
        let second_user = run_phase(Phase::User, &user_steps(&cfg), &host, false);
        assert_eq!(state.borrow().mutations.len(), first_mutations);
        for outcome in second_elevated.steps.iter().chain(second_user.steps.iter()) {
            assert_eq!(outcome.status, StepStatus::Converged, "{outcome:?}");
        }
        let settings_text = std::fs::read_to_string(dir.path().join("settings.json")).unwrap();
        assert!(settings_text.contains("dev.containers.dockerPath"));
        assert!(!dir.path().join("settings.json.bak").exists());
    }

    #[test]
    fn each_step_is_idempotent_in_isolation() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.host_engine.enabled = true;
        let all_steps: Vec<Step> = elevated_steps(&cfg)
            .into_iter()
            .chain(user_steps(&cfg))
            .filter(|step| !matches!(step.kind, StepKind::HostEngine | StepKind::Editor))
            .collect();
        for step in all_steps {
            let state = Rc::new(RefCell::new(FakeHostState {
                editor_installed: true,
                engine_installed: true,
                distros: vec!["Ubuntu".to_string()],
                ..FakeHostState::default()
            }));
            let runner = fake_host(state.clone());
            let host = Host::new(&cfg, &runner);
            if step.kind != StepKind::Distro {
                assert!(matches!(step.probe(&host).unwrap(), Probe::NotConverged(_)));
            }
            let first = run_phase(Phase::User, std::slice::from_ref(&step), &host, false);
            assert_eq!(first.status(), 0, "{first:?}");
            let mutations = state.borrow().mutations.len();
            assert_eq!(step.probe(&host).unwrap(), Probe::Converged, "{}", step.id);
            run_phase(Phase::User, std::slice::from_ref(&step), &host, false);
            assert_eq!(state.borrow().mutations.len(), mutations, "{}", step.id);
        }
    }

    #[test]
    fn failing_step_does_not_abort_the_phase() {
        let dir = tempdir().unwrap();
        let cfg = test_config(&dir);
        let runner = MockRunner::with(|call| {
            if call.program == "dism.exe" && call.args.contains(&"/enable-feature".to_string()) {
                if call.args.iter().any(|a| a.ends_with("Subsystem-Linux")) {
                    return Ok(status(5, "Error: 5\nAccess is denied."));
                }
                return Ok(ok(""));
            }
            if call.program == "dism.exe" {
                return Ok(ok("State : Disabled\n"));
            }
            Ok(ok("Default Version: 2\n"))
        });
        let host = Host::new(&cfg, &runner);
        let report = run_phase(Phase::Elevated, &elevated_steps(&cfg), &host, false);
        let statuses: Vec<StepStatus> = report.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Failed, StepStatus::Applied, StepStatus::Converged]
        );
        assert_eq!(report.status(), 1);
        let first = report.first_failure().unwrap().to_string();
        assert!(
            first.starts_with("step feature:Microsoft-Windows-Subsystem-Linux failed:"),
            "{first}"
        );
        let failed: Vec<&StepOutcome> = report.failed().collect();
        assert_eq!(
            failed[0].error_details.as_ref().map(|d| d.error_code.as_str()),
            Some("elevation_required")
        );
    }

    #[test]
    fn probe_error_is_recorded_as_failure() {
        let dir = tempdir().unwrap();
        let cfg = test_config(&dir);
        let runner = MockRunner::with(|_| Err(io::Error::new(io::ErrorKind::NotFound, "wsl")));
        let host = Host::new(&cfg, &runner);
        let steps = vec![Step::new("distro", StepKind::Distro)];
        let report = run_phase(Phase::User, &steps, &host, false);
        assert_eq!(report.steps[0].status, StepStatus::Failed);
        assert_eq!(
            report.steps[0].error_details.as_ref().unwrap().error_code,
            "tool_not_found"
        );
    }

    #[test]
    fn dry_run_never_runs_commands_or_touches_files() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.host_engine.enabled = true;
        let runner = MockRunner::default();
        let host = Host::new(&cfg, &runner);
        let elevated = run_phase(Phase::Elevated, &elevated_steps(&cfg), &host, true);
        let user = run_phase(Phase::User, &user_steps(&cfg), &host, true);
        assert!(runner.calls().is_empty());
        assert!(!dir.path().join("settings.json").exists());
        for outcome in elevated.steps.iter().chain(user.steps.iter()) {
            assert_eq!(outcome.status, StepStatus::Planned);
            assert!(outcome.detail.as_deref().unwrap().starts_with("if not converged: "));
        }
        assert!(elevated.steps[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("/featurename:Microsoft-Windows-Subsystem-Linux"));
    }

    #[test]
    fn survey_reports_pending_without_applying() {
        let dir = tempdir().unwrap();
        let cfg = test_config(&dir);
        let state = Rc::new(RefCell::new(FakeHostState::default()));
        let runner = fake_host(state.clone());
        let host = Host::new(&cfg, &runner);
        let report = survey_phase(Phase::Elevated, &elevated_steps(&cfg), &host);
        assert!(report
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Pending));
        assert!(state.borrow().mutations.is_empty());
    }
}
