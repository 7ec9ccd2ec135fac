use crate::error::{BootError, ProcessErrorDetails};
use std::io::{self, Write};
use std::process::{Command, Stdio};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        decode_output(&self.stdout)
    }

    pub fn stderr_text(&self) -> String {
        decode_output(&self.stderr)
    }
}

pub trait CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input)?;
            }
        }
        let output = child.wait_with_output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

// wsl.exe writes UTF-16LE to pipes.
pub fn decode_output(bytes: &[u8]) -> String {
    let looks_utf16 = bytes.len() >= 2
        && bytes.len() % 2 == 0
        && (bytes.starts_with(&[0xFF, 0xFE])
            || bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count() * 2
                >= bytes.len() / 2);
    let text = if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).to_string()
    };
    text.trim_start_matches('\u{feff}').replace('\0', "")
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

pub fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

fn spawn_error_details(err: &io::Error, program: &str, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "tool_not_found".to_string(),
            hint: Some(format!("Install `{program}` and ensure it is on your PATH.")),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("requires elevation")
        || lower.contains("access is denied")
        || lower.contains("error: 740")
    {
        return (
            "elevation_required".to_string(),
            Some("Re-run `wslboot apply` so the elevated phase can handle this step.".to_string()),
        );
    }

    if lower.contains("0x80370102") || lower.contains("enable virtualization") {
        return (
            "virtualization_unavailable".to_string(),
            Some(
                "Hardware virtualization is disabled. Enable it in firmware settings and reboot."
                    .to_string(),
            ),
        );
    }

    if lower.contains("there is no distribution with the supplied name")
        || lower.contains("wsl_e_distro_not_found")
    {
        return (
            "distro_missing".to_string(),
            Some("The WSL distribution is not installed yet; rerun after a reboot.".to_string()),
        );
    }

    if lower.contains("could not resolve host")
        || lower.contains("temporary failure resolving")
        || lower.contains("network is unreachable")
    {
        return (
            "network_unavailable".to_string(),
            Some("Check network connectivity and retry.".to_string()),
        );
    }

    if lower.contains("unable to locate package") {
        return (
            "package_not_found".to_string(),
            Some("Check guest.packages in config.yaml.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

pub fn probe_command<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
) -> Result<CommandOutput, BootError> {
    let command = render_command(program, args);
    runner.run(program, args, None).map_err(|err| {
        let details = spawn_error_details(&err, program, &command);
        BootError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details,
        }
    })
}

pub fn execute<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
) -> Result<CommandOutput, BootError> {
    execute_with(runner, program, args, None, &[0])
}

pub fn execute_with<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    ok_codes: &[i32],
) -> Result<CommandOutput, BootError> {
    let command = render_command(program, args);
    tracing::debug!(%command, "running command");
    let cmd_output = runner.run(program, args, stdin).map_err(|err| {
        let details = spawn_error_details(&err, program, &command);
        BootError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details,
        }
    })?;
    if !ok_codes.contains(&cmd_output.status_code) {
        let mut stderr = cmd_output.stderr_text().trim().to_string();
        if stderr.is_empty() {
            stderr = cmd_output.stdout_text().trim().to_string();
        }
        let (error_code, hint) = classify_command_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        return Err(BootError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() {
                    None
                } else {
                    Some(stderr)
                },
            },
        });
    }
    Ok(cmd_output)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
    }

    #[test]
    fn decode_output_handles_wsl_utf16() {
        let bytes = utf16le("Ubuntu\r\ndocker-desktop\r\n");
        assert_eq!(decode_output(&bytes), "Ubuntu\r\ndocker-desktop\r\n");
    }

    #[test]
    fn decode_output_strips_utf16_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend(utf16le("Ubuntu"));
        assert_eq!(decode_output(&bytes), "Ubuntu");
    }

    #[test]
    fn decode_output_keeps_plain_utf8() {
        assert_eq!(decode_output(b"podman version 5.0.1\n"), "podman version 5.0.1\n");
    }

    #[test]
    fn shell_single_quote_escapes_quotes() {
        assert_eq!(shell_single_quote("foo'bar"), "'foo'\\''bar'");
        assert_eq!(shell_single_quote("a b"), "'a b'");
    }

    #[test]
    fn render_command_quotes_whitespace() {
        let rendered = render_command("wsl", &args(["-d", "Ubuntu", "--", "sh", "-c", "echo hi"]));
        assert_eq!(rendered, "wsl -d Ubuntu -- sh -c \"echo hi\"");
    }

    #[test]
    fn classify_failure_detects_elevation() {
        let (code, hint) = classify_command_failure("Error: 740\nThe requested operation requires elevation.");
        assert_eq!(code, "elevation_required");
        assert!(hint.is_some());
    }

    #[test]
    fn classify_failure_detects_missing_package() {
        let (code, _) = classify_command_failure("E: Unable to locate package podmn");
        assert_eq!(code, "package_not_found");
    }

    #[test]
    fn execute_nonzero_exit_surfaces_structured_details() {
        let runner = MockRunner::with(|_| Ok(status(1, "E: Unable to locate package podmn")));
        let err = execute(&runner, "wsl", &args(["--status"])).expect_err("should fail");
        let details = err.details().expect("details");
        assert_eq!(details.error_code, "package_not_found");
        assert_eq!(details.command.as_deref(), Some("wsl --status"));
        assert!(err.to_string().contains("status 1"));
    }

    #[test]
    fn execute_spawn_not_found_sets_tool_not_found() {
        let runner =
            MockRunner::with(|_| Err(io::Error::new(io::ErrorKind::NotFound, "missing")));
        let err = execute(&runner, "dism.exe", &[]).expect_err("should fail");
        assert_eq!(err.details().expect("details").error_code, "tool_not_found");
    }

    #[test]
    fn execute_with_accepts_extra_success_codes() {
        let runner = MockRunner::with(|_| Ok(status(3010, "")));
        let output = execute_with(&runner, "dism.exe", &[], None, &[0, 3010]).expect("accepted");
        assert_eq!(output.status_code, 3010);
    }

    #[test]
    fn probe_command_returns_nonzero_output() {
        let runner = MockRunner::with(|_| Ok(status(1, "")));
        let output = probe_command(&runner, "code", &args(["--version"])).expect("output");
        assert!(!output.success());
    }

    #[test]
    fn mock_runner_records_stdin() {
        let runner = MockRunner::default();
        execute_with(&runner, "wsl", &args(["sh"]), Some(b"echo"), &[0]).expect("ok");
        assert_eq!(runner.calls()[0].stdin.as_deref(), Some(&b"echo"[..]));
    }
}
