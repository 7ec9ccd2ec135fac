mod config;
mod download;
mod elevation;
mod error;
mod fsutil;
mod launcher;
mod runner;
mod sentinel;
mod settings;
mod steps;
mod tools;

use clap::{Parser, Subcommand};
use config::{
    default_config_dir, load_config, read_config, resolve_config_path, validate_config, Config,
    DEFAULT_CONFIG_YAML,
};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use elevation::{Elevator, SystemElevator};
use error::{BootError, ProcessErrorDetails};
use fsutil::ensure_parent;
use launcher::{Launcher, RunMode, RunOptions, RunSummary};
use runner::RealCommandRunner;
use sentinel::{default_sentinel_path, read_sentinel, remove_sentinel, sentinel_base_dir};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use steps::{elevated_steps, survey_phase, user_steps, Host, Phase, PhaseReport, StepStatus};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "WSLBOOT_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "wslboot",
    version,
    about = "Converge a Windows host into a WSL container development box"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the elevated and user phases.
    Apply {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Start the elevated phase and return without waiting for it.
        #[arg(long, default_value_t = false)]
        detach: bool,
        #[arg(long)]
        sentinel_path: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[arg(long, default_value_t = false, hide = true)]
        elevated_phase: bool,
        #[arg(long, hide = true)]
        run_id: Option<String>,
    },
    /// Probe every step without changing anything.
    Status {
        /// Exit non-zero unless every step is converged.
        #[arg(long, default_value_t = false)]
        check: bool,
    },
    Sentinel {
        #[command(subcommand)]
        command: SentinelCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Paths,
}

#[derive(Subcommand, Debug)]
enum SentinelCommand {
    /// Read the status an elevated phase left behind.
    Read {
        path: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long, default_value_t = false)]
        remove: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<(), BootError> {
    let cli = Cli::parse();
    init_logging();
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Apply {
            dry_run,
            detach,
            sentinel_path,
            yes,
            elevated_phase,
            run_id,
        } => handle_apply(
            &ctx,
            RunOptions {
                dry_run,
                elevated_phase,
                detach,
                sentinel_path,
                run_id,
            },
            yes,
        ),
        Commands::Status { check } => handle_status(&ctx, check),
        Commands::Sentinel { command } => handle_sentinel(&ctx, command),
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Paths => handle_paths(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{}", style(err.to_string()).red());
            if let Some(hint) = err.details().and_then(|details| details.hint) {
                eprintln!("hint: {hint}");
            }
        }
        std::process::exit(err.exit_code());
    }

    Ok(())
}

fn confirm_elevation() -> Result<bool, BootError> {
    println!(
        "{}",
        style("Enabling Windows features needs administrator rights.").bold()
    );
    println!(
        "{}",
        style("An elevation prompt will open; this window waits for it to finish.").dim()
    );
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Continue?")
        .default(true)
        .interact()?)
}

fn handle_apply(ctx: &Context, opts: RunOptions, yes: bool) -> Result<(), BootError> {
    let cfg = load_config(&ctx.config_path)?;
    let runner = RealCommandRunner;
    let elevator = SystemElevator::new(&runner, env::current_exe()?);

    let interactive = !yes && !ctx.json && io::stdin().is_terminal();
    if interactive
        && !opts.dry_run
        && !opts.elevated_phase
        && !elevator.is_elevated()
        && !confirm_elevation()?
    {
        return Err(BootError::Elevation(
            "cancelled before requesting elevation".to_string(),
        ));
    }

    let summary = Launcher::new(&cfg, &ctx.config_path, &runner, &elevator).run(&opts)?;
    let status = summary.status();
    let failure = summary.phases.iter().find_map(PhaseReport::first_failure);
    if !ctx.json {
        print_summary(&summary);
        return failure.map_or(Ok(()), Err);
    }
    print_json(&JsonResult {
        ok: status == 0,
        result: Some(&summary),
        error: failure.map(|err| err.to_string()),
        error_details: None,
    })?;
    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}

fn count_failed(phases: &[PhaseReport]) -> usize {
    phases.iter().map(|report| report.failed().count()).sum()
}

fn print_phases(phases: &[PhaseReport]) {
    for report in phases {
        println!(
            "{}",
            style(format!("{} phase", report.phase.as_str())).bold().cyan()
        );
        for step in &report.steps {
            let label = style(step.status.label());
            let label = match step.status {
                StepStatus::Converged => label.green(),
                StepStatus::Applied => label.cyan(),
                StepStatus::RestartRequired | StepStatus::Pending => label.yellow(),
                StepStatus::Planned => label.dim(),
                StepStatus::Failed => label.red(),
            };
            println!("  [{}] {} - {}", label, step.id, step.description);
            if let Some(detail) = &step.detail {
                println!("      {}", style(detail).dim());
            }
            if let Some(hint) = step
                .error_details
                .as_ref()
                .and_then(|details| details.hint.as_ref())
            {
                println!("      hint: {hint}");
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    print_phases(&summary.phases);
    match summary.mode {
        RunMode::Detached => {
            if let Some(path) = &summary.sentinel_path {
                println!(
                    "Elevated phase started. Check it with `wslboot sentinel read {}`.",
                    path.display()
                );
            }
        }
        RunMode::DryRun => println!("{}", style("Dry run: nothing was changed.").dim()),
        _ => {}
    }
    if summary.restart_required {
        println!(
            "{}",
            style("Restart Windows to finish enabling features, then run apply again.").yellow()
        );
    }
    let failed = count_failed(&summary.phases);
    if failed > 0 {
        println!("{}", style(format!("{failed} step(s) failed")).bold().red());
    }
}

fn handle_status(ctx: &Context, check: bool) -> Result<(), BootError> {
    let cfg = load_config(&ctx.config_path)?;
    let runner = RealCommandRunner;
    let host = Host::new(&cfg, &runner);
    let phases = vec![
        survey_phase(Phase::Elevated, &elevated_steps(&cfg), &host),
        survey_phase(Phase::User, &user_steps(&cfg), &host),
    ];
    let converged = phases
        .iter()
        .flat_map(|report| report.steps.iter())
        .all(|step| step.status == StepStatus::Converged);
    let ok = converged || !check;

    if ctx.json {
        print_json(&JsonResult {
            ok,
            result: Some(json!({ "converged": converged, "phases": phases })),
            error: (!ok).then(|| "host is not fully converged".to_string()),
            error_details: None,
        })?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    print_phases(&phases);
    if ok {
        return Ok(());
    }
    Err(BootError::Process(
        "host is not fully converged; run `wslboot apply`".to_string(),
    ))
}

fn handle_sentinel(ctx: &Context, command: SentinelCommand) -> Result<(), BootError> {
    match command {
        SentinelCommand::Read {
            path,
            run_id,
            remove,
        } => {
            let record = read_sentinel(&path, run_id.as_deref())?;
            if remove {
                remove_sentinel(&path);
            }
            output(
                ctx,
                json!({"path": path, "status": record.status, "record": record}),
            )?;
            if record.status != 0 {
                std::process::exit(record.status);
            }
            Ok(())
        }
    }
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), BootError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let cfg = read_config(&ctx.config_path)?;
            validate_config(&cfg)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let exists = ctx.config_path.exists();
            let cfg: Config = load_config(&ctx.config_path)?;
            output(
                ctx,
                json!({"path": ctx.config_path, "exists": exists, "config": cfg}),
            )
        }
    }
}

fn handle_paths(ctx: &Context) -> Result<(), BootError> {
    let cfg = load_config(&ctx.config_path)?;
    let sentinel_dir = sentinel_base_dir(&cfg.handoff);
    output(
        ctx,
        json!({
            "config_dir": default_config_dir(),
            "config_path": ctx.config_path,
            "config_exists": ctx.config_path.exists(),
            "sentinel_dir": sentinel_dir,
            "default_sentinel_path": default_sentinel_path(&sentinel_dir),
            "editor_settings_path": cfg.editor.resolved_settings_path(),
            "log_env": LOG_ENV,
        }),
    )
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), BootError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), BootError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
