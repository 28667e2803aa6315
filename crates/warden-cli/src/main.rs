//! Warden command-line interface for update, rescue, and console operations.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;
use schemars::schema_for;
use serde_json::{json, to_string_pretty};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use warden_core::{
    config::{bootstrap_template, DEFAULT_CONFIG_PATH},
    logging, privilege, ApplyOutcome, ConsoleBridge, ProcessLocator, SystemProcessTable,
    UpdateController, WardenConfig, WardenError,
};

fn load_cli_config(path: &Path) -> Result<WardenConfig> {
    let config = WardenConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {} (override WARDEN_CONFIG to replace).",
            config.path.display()
        );
    }

    Ok(config)
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version,
    about = "Host agent utilities: self-update pipeline and external-process console bridge."
)]
struct Cli {
    /// Path to the Warden configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands covering the operator surface of the agent.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the remote source for a newer version without writing anything.
    Check {
        /// Emit the outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Fetch, validate, and install the latest source, then restart the unit.
    Apply {
        /// Skip the interactive confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Generate the standalone rescue tool from the installed artifact.
    ///
    /// Run this *before* applying an update if you want a rollback path.
    Rescue,

    /// Show what is known about the supervised target process.
    Status {
        /// Emit the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inject a command line into the target's console session.
    Send {
        /// The command to dispatch (joined with spaces).
        #[arg(trailing_var_arg = true, required = true)]
        line: Vec<String>,
    },

    /// Tail the target process's log file.
    Logs {
        /// Number of trailing lines to show (default from configuration).
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },

    /// Inspect or bootstrap the configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the resolved configuration as TOML.
    Show,
    /// Print the JSON schema of the configuration format.
    Schema,
    /// Print a commented bootstrap template.
    Template,
}

fn main() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { json } => cmd_check(&cli.config, json),
        Commands::Apply { yes } => cmd_apply(&cli.config, yes),
        Commands::Rescue => cmd_rescue(&cli.config),
        Commands::Status { json } => cmd_status(&cli.config, json),
        Commands::Send { line } => cmd_send(&cli.config, &line.join(" ")),
        Commands::Logs { lines } => cmd_logs(&cli.config, lines),
        Commands::Config { command } => cmd_config(&cli.config, command),
    }
}

fn cmd_check(config_path: &Path, as_json: bool) -> Result<()> {
    let config = Arc::new(load_cli_config(config_path)?);
    let controller = UpdateController::new(config);
    let outcome = controller.check_for_update()?;

    if as_json {
        println!(
            "{}",
            json!({
                "running": controller.current_version(),
                "available": outcome.available,
                "remote_version": outcome.remote_version,
            })
        );
        return Ok(());
    }

    if outcome.available {
        println!(
            "Update available: {} -> {}",
            controller.current_version(),
            outcome.remote_version.as_deref().unwrap_or("?")
        );
    } else {
        println!(
            "No update available (running {}).",
            controller.current_version()
        );
    }
    Ok(())
}

fn cmd_apply(config_path: &Path, yes: bool) -> Result<()> {
    let config = Arc::new(load_cli_config(config_path)?);
    privilege::ensure_privilege_support()?;

    if !yes {
        print!(
            "Overwrite {} and restart {}? [y/N] ",
            config.agent.artifact_path.display(),
            config.agent.service_unit
        );
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            bail!("aborted");
        }
    }

    let controller = UpdateController::new(config);
    match controller.apply_update() {
        Ok(ApplyOutcome::Applied { version }) => {
            println!("Updated to {version}; service restart scheduled.");
            // Give the detached restart thread its window before exiting.
            std::thread::sleep(controller_grace());
            Ok(())
        }
        Ok(ApplyOutcome::AlreadyCurrent) => {
            println!(
                "Already running the latest version ({}).",
                controller.current_version()
            );
            Ok(())
        }
        Err(err @ WardenError::UpdateBusy) => bail!("{err}"),
        Err(err) => Err(err.into()),
    }
}

fn controller_grace() -> std::time::Duration {
    std::time::Duration::from_secs(2)
}

fn cmd_rescue(config_path: &Path) -> Result<()> {
    let config = Arc::new(load_cli_config(config_path)?);
    let controller = UpdateController::new(config);
    let path = controller.generate_rescue()?;
    println!("Rescue tool written to {}.", path.display());
    println!("Operations: `{} reset-credential` or `{} factory-reset`.", path.display(), path.display());
    Ok(())
}

fn cmd_status(config_path: &Path, as_json: bool) -> Result<()> {
    let config = load_cli_config(config_path)?;
    let locator = ProcessLocator::new(SystemProcessTable, config.console.signature.clone());
    let target = locator.locate();

    if as_json {
        println!(
            "{}",
            json!({
                "signature": config.console.signature,
                "exists": target.exists,
                "pid": target.pid,
                "owner": target.owner,
                "working_dir": target.working_dir,
                "matches": target.matches,
            })
        );
        return Ok(());
    }

    println!("Target signature: {}", config.console.signature);
    if !target.exists {
        println!("Target process: not running");
        return Ok(());
    }

    let unknown = "unknown".to_string();
    println!(
        "Target process: pid {}",
        target.pid.map(|p| p.to_string()).unwrap_or(unknown.clone())
    );
    println!("Owner: {}", target.owner.unwrap_or(unknown.clone()));
    println!(
        "Working directory: {}",
        target
            .working_dir
            .map(|p| p.display().to_string())
            .unwrap_or(unknown)
    );
    if target.matches.len() > 1 {
        warn!(
            "signature matched {} processes ({:?}); using the first",
            target.matches.len(),
            target.matches
        );
        println!(
            "Note: {} processes matched; first match is used.",
            target.matches.len()
        );
    }
    Ok(())
}

fn cmd_send(config_path: &Path, line: &str) -> Result<()> {
    let config = Arc::new(load_cli_config(config_path)?);
    let bridge = ConsoleBridge::new(config, SystemProcessTable);
    bridge.send_command(line)?;
    println!("Dispatched. (No acknowledgement channel; check the logs.)");
    Ok(())
}

fn cmd_logs(config_path: &Path, lines: Option<usize>) -> Result<()> {
    let mut config = load_cli_config(config_path)?;
    if let Some(lines) = lines {
        config.console.tail_lines = lines;
    }
    let bridge = ConsoleBridge::new(Arc::new(config), SystemProcessTable);
    match bridge.tail_log() {
        Ok(tail) => {
            println!("==> {} <==", tail.path.display());
            for line in tail.lines {
                println!("{line}");
            }
            Ok(())
        }
        Err(err @ WardenError::LogNotFound { .. }) => {
            // Expected before the target has produced output; not fatal.
            println!("{err}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_config(config_path: &Path, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = load_cli_config(config_path)?;
            print!(
                "{}",
                toml::to_string_pretty(&config).context("render configuration")?
            );
            Ok(())
        }
        ConfigCommand::Schema => {
            let schema = schema_for!(WardenConfig);
            println!("{}", to_string_pretty(&schema)?);
            Ok(())
        }
        ConfigCommand::Template => {
            print!("{}", bootstrap_template());
            Ok(())
        }
    }
}
