use crate::error::BootError;
use crate::runner::{args, CommandRunner};
use crate::tools::tool_answers;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

// ERROR_CANCELLED, reported by the wrapper when UAC is declined.
pub const ELEVATION_DECLINED_STATUS: i32 = 1223;

pub trait ElevatedProcess {
    fn try_wait(&mut self) -> io::Result<Option<i32>>;
    fn kill(&mut self) -> io::Result<()>;
}

impl ElevatedProcess for Child {
    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        // Killed by a signal has no code.
        Ok(Child::try_wait(self)?.map(|status| status.code().unwrap_or(1)))
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)?;
        Child::wait(self)?;
        Ok(())
    }
}

pub trait Elevator {
    fn is_elevated(&self) -> bool;
    fn spawn_elevated(&self, args: &[String]) -> Result<Box<dyn ElevatedProcess>, BootError>;
}

pub struct SystemElevator<'a, R: CommandRunner> {
    runner: &'a R,
    exe: PathBuf,
}

impl<'a, R: CommandRunner> SystemElevator<'a, R> {
    pub fn new(runner: &'a R, exe: PathBuf) -> Self {
        Self { runner, exe }
    }
}

impl<R: CommandRunner> Elevator for SystemElevator<'_, R> {
    fn is_elevated(&self) -> bool {
        if cfg!(windows) {
            // `net session` needs administrator rights to list sessions.
            tool_answers(self.runner, "net", &args(["session"])).unwrap_or(false)
        } else {
            self.runner
                .run("id", &args(["-u"]), None)
                .map(|output| output.success() && output.stdout_text().trim() == "0")
                .unwrap_or(false)
        }
    }

    fn spawn_elevated(&self, child_args: &[String]) -> Result<Box<dyn ElevatedProcess>, BootError> {
        let (program, program_args) = elevated_command(&self.exe, child_args, cfg!(windows));
        if which::which(&program).is_err() {
            return Err(BootError::Spawn(format!(
                "`{program}` is required to request elevation but was not found on PATH"
            )));
        }
        tracing::info!(%program, exe = %self.exe.display(), "requesting elevation");
        let child = Command::new(&program)
            .args(&program_args)
            .spawn()
            .map_err(|err| BootError::Spawn(format!("failed to start `{program}`: {err}")))?;
        Ok(Box::new(child))
    }
}

pub fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// Quoting as CommandLineToArgvW parses it.
pub fn windows_arg_quote(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\t', '\n', '\x0b', '"']) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut backslashes = 0;
    for ch in value.chars() {
        match ch {
            '\\' => {
                backslashes += 1;
                continue;
            }
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(ch);
            }
        }
        backslashes = 0;
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
    out
}

pub fn elevated_command(exe: &Path, child_args: &[String], windows: bool) -> (String, Vec<String>) {
    let exe = exe.to_string_lossy().to_string();
    if !windows {
        let mut out = vec![exe];
        out.extend(child_args.iter().cloned());
        return ("sudo".to_string(), out);
    }
    let arg_list = child_args
        .iter()
        .map(|arg| windows_arg_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let script = format!(
        "try {{ $p = Start-Process -FilePath {} -ArgumentList {} -Verb RunAs -PassThru -Wait; exit $p.ExitCode }} catch {{ exit {} }}",
        powershell_quote(&exe),
        powershell_quote(&arg_list),
        ELEVATION_DECLINED_STATUS
    );
    (
        "powershell".to_string(),
        args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", script.as_str()]),
    )
}
