use crate::error::BootError;
use crate::runner::{args, execute, execute_with, probe_command, shell_single_quote, CommandRunner};
use std::io;
use std::path::{Path, PathBuf};

// DISM: succeeded, restart required.
pub const RESTART_REQUIRED_STATUS: i32 = 3010;

pub fn tool_answers<R: CommandRunner>(
    runner: &R,
    program: &str,
    tool_args: &[String],
) -> Result<bool, BootError> {
    match runner.run(program, tool_args, None) {
        Ok(output) => Ok(output.success()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(BootError::Process(format!(
            "failed to run `{program}`: {err}"
        ))),
    }
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty())
}

// A pending enable counts as enabled.
pub fn parse_feature_state(text: &str) -> bool {
    non_empty_lines(text)
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim().eq_ignore_ascii_case("state")).then(|| value.trim().to_lowercase())
        })
        .any(|state| state == "enabled" || state == "enable pending")
}

pub struct WindowsFeatures<'a, R: CommandRunner> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> WindowsFeatures<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    pub fn is_enabled(&self, feature: &str) -> Result<bool, BootError> {
        let output = probe_command(self.runner, DISM_PROGRAM, &dism_info_args(feature))?;
        Ok(output.success() && parse_feature_state(&output.stdout_text()))
    }

    pub fn enable(&self, feature: &str) -> Result<bool, BootError> {
        let output = execute_with(
            self.runner,
            DISM_PROGRAM,
            &dism_enable_args(feature),
            None,
            &[0, RESTART_REQUIRED_STATUS],
        )?;
        Ok(output.status_code == RESTART_REQUIRED_STATUS)
    }
}

pub const DISM_PROGRAM: &str = "dism.exe";

pub fn dism_info_args(feature: &str) -> Vec<String> {
    args([
        "/online".to_string(),
        "/English".to_string(),
        "/get-featureinfo".to_string(),
        format!("/featurename:{feature}"),
    ])
}

pub fn dism_enable_args(feature: &str) -> Vec<String> {
    args([
        "/online".to_string(),
        "/enable-feature".to_string(),
        format!("/featurename:{feature}"),
        "/all".to_string(),
        "/norestart".to_string(),
    ])
}

pub fn parse_default_version(text: &str) -> Option<u8> {
    non_empty_lines(text)
        .find(|line| line.to_lowercase().contains("default version"))
        .and_then(|line| line.rsplit(':').next())
        .and_then(|value| value.trim().parse::<u8>().ok())
}

pub fn parse_distro_list(text: &str) -> Vec<String> {
    non_empty_lines(text).map(str::to_string).collect()
}

pub fn parse_installed_packages(text: &str) -> Vec<String> {
    non_empty_lines(text)
        .filter_map(|line| {
            let (package, status) = line.split_once(' ')?;
            status
                .trim()
                .ends_with("install ok installed")
                .then(|| package.trim().to_string())
        })
        .collect()
}

pub const WSL_PROGRAM: &str = "wsl";

pub fn wsl_set_default_version_args(version: u8) -> Vec<String> {
    args(["--set-default-version".to_string(), version.to_string()])
}

pub fn apt_install_script(packages: &[String]) -> String {
    format!(
        "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
        packages.join(" ")
    )
}

pub fn write_executable_script(path: &str) -> String {
    let quoted = shell_single_quote(path);
    format!("mkdir -p \"$(dirname {quoted})\" && cat > {quoted} && chmod 0755 {quoted}")
}

pub fn append_shell_line_script(line: &str) -> String {
    format!(
        "printf '%s\\n' {} >> \"$HOME/.bashrc\"",
        shell_single_quote(line)
    )
}

pub struct Wsl<'a, R: CommandRunner> {
    runner: &'a R,
    distro: &'a str,
}

impl<'a, R: CommandRunner> Wsl<'a, R> {
    pub fn new(runner: &'a R, distro: &'a str) -> Self {
        Self { runner, distro }
    }

    pub fn default_version(&self) -> Result<Option<u8>, BootError> {
        let output = probe_command(self.runner, WSL_PROGRAM, &args(["--status"]))?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_default_version(&output.stdout_text()))
    }

    pub fn set_default_version(&self, version: u8) -> Result<(), BootError> {
        execute(self.runner, WSL_PROGRAM, &wsl_set_default_version_args(version))?;
        Ok(())
    }

    // WSL exits non-zero when no distro is installed.
    pub fn distros(&self) -> Result<Vec<String>, BootError> {
        let output = probe_command(self.runner, WSL_PROGRAM, &args(["--list", "--quiet"]))?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse_distro_list(&output.stdout_text()))
    }

    pub fn has_distro(&self) -> Result<bool, BootError> {
        Ok(self
            .distros()?
            .iter()
            .any(|name| name.eq_ignore_ascii_case(self.distro)))
    }

    pub fn install_distro(&self) -> Result<(), BootError> {
        execute(self.runner, WSL_PROGRAM, &self.install_args())?;
        Ok(())
    }

    pub fn install_args(&self) -> Vec<String> {
        args(["--install", "-d", self.distro, "--no-launch"])
    }

    pub fn guest_args(&self, as_root: bool, argv: &[String]) -> Vec<String> {
        let mut out = args(["-d", self.distro]);
        if as_root {
            out.extend(args(["-u", "root"]));
        }
        out.push("--exec".to_string());
        out.extend(argv.iter().cloned());
        out
    }

    pub fn sh_args(&self, as_root: bool, script: &str) -> Vec<String> {
        self.guest_args(as_root, &args(["sh", "-c", script]))
    }

    pub fn missing_packages(&self, packages: &[String]) -> Result<Vec<String>, BootError> {
        let mut argv = args(["dpkg-query", "-W", "-f=${Package} ${Status}\\n"]);
        argv.extend(packages.iter().cloned());
        // dpkg-query exits 1 when any package is unknown but still lists the rest.
        let output = probe_command(self.runner, WSL_PROGRAM, &self.guest_args(false, &argv))?;
        let installed = parse_installed_packages(&output.stdout_text());
        Ok(packages
            .iter()
            .filter(|package| !installed.contains(package))
            .cloned()
            .collect())
    }

    pub fn install_packages(&self, packages: &[String]) -> Result<(), BootError> {
        let script = apt_install_script(packages);
        execute(self.runner, WSL_PROGRAM, &self.sh_args(true, &script))?;
        Ok(())
    }

    pub fn file_matches(&self, path: &str, content: &str) -> Result<bool, BootError> {
        let quoted = shell_single_quote(path);
        let script = format!("test -x {quoted} && cat {quoted}");
        let output = probe_command(self.runner, WSL_PROGRAM, &self.sh_args(false, &script))?;
        Ok(output.success() && String::from_utf8_lossy(&output.stdout) == content)
    }

    pub fn write_executable(&self, path: &str, content: &str) -> Result<(), BootError> {
        let script = write_executable_script(path);
        execute_with(
            self.runner,
            WSL_PROGRAM,
            &self.sh_args(true, &script),
            Some(content.as_bytes()),
            &[0],
        )?;
        Ok(())
    }

    pub fn has_shell_line(&self, line: &str) -> Result<bool, BootError> {
        let script = format!(
            "grep -qxF -- {} \"$HOME/.bashrc\"",
            shell_single_quote(line)
        );
        let output = probe_command(self.runner, WSL_PROGRAM, &self.sh_args(false, &script))?;
        Ok(output.success())
    }

    pub fn append_shell_line(&self, line: &str) -> Result<(), BootError> {
        let script = append_shell_line_script(line);
        execute(self.runner, WSL_PROGRAM, &self.sh_args(false, &script))?;
        Ok(())
    }
}

pub fn parse_connection_names(text: &str) -> Vec<String> {
    non_empty_lines(text)
        .map(|line| line.trim_end_matches('*').trim().to_string())
        .collect()
}

pub fn parse_machine_running(text: &str) -> bool {
    non_empty_lines(text).any(|line| line.eq_ignore_ascii_case("running"))
}

pub struct ContainerEngine<'a, R: CommandRunner> {
    runner: &'a R,
    program: String,
}

impl<'a, R: CommandRunner> ContainerEngine<'a, R> {
    pub fn new(runner: &'a R, command: &str) -> Self {
        Self {
            runner,
            program: resolve_program(command, None),
        }
    }

    pub fn is_installed(&self) -> Result<bool, BootError> {
        tool_answers(self.runner, &self.program, &args(["--version"]))
    }

    pub fn has_connection(&self, machine: &str) -> Result<bool, BootError> {
        let output = probe_command(
            self.runner,
            &self.program,
            &args(["system", "connection", "list", "--format", "{{.Name}}"]),
        )?;
        if !output.success() {
            return Ok(false);
        }
        Ok(parse_connection_names(&output.stdout_text())
            .iter()
            .any(|name| name == machine))
    }

    pub fn machine_init(&self, machine: &str) -> Result<(), BootError> {
        execute(self.runner, &self.program, &args(["machine", "init", machine]))?;
        Ok(())
    }

    pub fn machine_running(&self, machine: &str) -> Result<bool, BootError> {
        let output = probe_command(
            self.runner,
            &self.program,
            &args(["machine", "inspect", machine, "--format", "{{.State}}"]),
        )?;
        Ok(output.success() && parse_machine_running(&output.stdout_text()))
    }

    pub fn machine_start(&self, machine: &str) -> Result<(), BootError> {
        execute(self.runner, &self.program, &args(["machine", "start", machine]))?;
        Ok(())
    }
}

pub fn parse_extension_list(text: &str) -> Vec<String> {
    non_empty_lines(text)
        .map(|line| {
            // `--show-versions` output is `publisher.name@1.2.3`.
            line.split('@').next().unwrap_or(line).to_lowercase()
        })
        .collect()
}

// `which` honours PATHEXT, so `code.cmd` resolves.
pub fn resolve_program(command: &str, fallback: Option<PathBuf>) -> String {
    if let Ok(path) = which::which(command) {
        return path.to_string_lossy().to_string();
    }
    if let Some(path) = fallback.filter(|path| path.exists()) {
        return path.to_string_lossy().to_string();
    }
    command.to_string()
}

fn editor_fallback_path(command: &str) -> Option<PathBuf> {
    if command != "code" {
        return None;
    }
    dirs::data_local_dir().map(|dir| {
        dir.join("Programs")
            .join("Microsoft VS Code")
            .join("bin")
            .join("code.cmd")
    })
}

pub struct Editor<'a, R: CommandRunner> {
    runner: &'a R,
    command: String,
}

impl<'a, R: CommandRunner> Editor<'a, R> {
    pub fn new(runner: &'a R, command: &str) -> Self {
        Self {
            runner,
            command: command.to_string(),
        }
    }

    // The editor may have been installed earlier in this run.
    pub fn program(&self) -> String {
        resolve_program(&self.command, editor_fallback_path(&self.command))
    }

    pub fn is_installed(&self) -> Result<bool, BootError> {
        tool_answers(self.runner, &self.program(), &args(["--version"]))
    }

    pub fn has_extension(&self, extension: &str) -> Result<bool, BootError> {
        let output = probe_command(self.runner, &self.program(), &args(["--list-extensions"]))?;
        if !output.success() {
            return Ok(false);
        }
        let wanted = extension.to_lowercase();
        Ok(parse_extension_list(&output.stdout_text())
            .iter()
            .any(|installed| *installed == wanted))
    }

    pub fn install_extension(&self, extension: &str) -> Result<(), BootError> {
        execute(
            self.runner,
            &self.program(),
            &args(["--install-extension", extension]),
        )?;
        Ok(())
    }
}

pub fn run_installer<R: CommandRunner>(
    runner: &R,
    installer: &Path,
    installer_args: &[String],
) -> Result<(), BootError> {
    let program = installer.to_string_lossy().to_string();
    execute_with(
        runner,
        &program,
        installer_args,
        None,
        &[0, RESTART_REQUIRED_STATUS],
    )?;
    Ok(())
}
