//! patchguard command-line tool.
//!
//! Applies dependency-update patch sets from JSON request files, manages
//! rollback points, analyses conflict sets, and generates / validates the
//! configuration file.

mod apply;
mod risk;
mod rollback;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use patchguard_core::config::AppConfig;
use patchguard_core::conflict::ResolutionMode;
use patchguard_core::models::ApplicationStrategy;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Conflict-aware patch application with snapshot rollback.
#[derive(Parser, Debug)]
#[command(name = "patchguard", version, about = "Apply dependency-update patches safely")]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when it does
    /// not exist.
    #[arg(short, long, global = true, default_value = "./patchguard.toml")]
    config: PathBuf,

    /// Log filter, overriding `[logging] level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply the patch set described by a JSON request file.
    Apply {
        /// Application request (JSON).
        #[arg(short, long)]
        request: PathBuf,

        /// Repository to apply to, overriding the request's `repo_path`.
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Scheduling strategy, overriding the request.
        #[arg(short, long)]
        strategy: Option<ApplicationStrategy>,

        /// Conflict resolution mode, overriding the request.
        #[arg(short, long)]
        mode: Option<ResolutionMode>,

        /// Compute everything but write nothing.
        #[arg(long)]
        dry_run: bool,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Manage rollback points.
    Rollback {
        /// Repository the rollback points belong to.
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        #[command(subcommand)]
        action: RollbackAction,
    },

    /// Analyse (and optionally resolve) a conflict set from a JSON file.
    Risk {
        /// JSON array of conflicts.
        #[arg(long)]
        conflicts: PathBuf,

        /// Resolve every conflict under this mode and print the outcome.
        #[arg(long)]
        resolve: Option<ResolutionMode>,

        #[arg(long)]
        json: bool,
    },

    /// Generate a default configuration file.
    Init {
        #[arg(short, long, default_value = "./patchguard.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(Subcommand, Debug)]
pub enum RollbackAction {
    /// Snapshot the working tree now.
    Create {
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// List known rollback points.
    List,
    /// Restore a rollback point.
    Restore { id: String },
    /// Delete a rollback point and its backup.
    Delete { id: String },
    /// Delete rollback points older than the given age.
    Cleanup {
        /// Maximum age in hours. Defaults to `[rollback] max_age_hours`.
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_init(&output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_validate(&cli.config)
        }
        command => {
            let config = load_config(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));

            match command {
                Commands::Apply {
                    request,
                    repo,
                    strategy,
                    mode,
                    dry_run,
                    json,
                } => {
                    let overrides = apply::Overrides {
                        repo,
                        strategy,
                        mode,
                        dry_run,
                    };
                    apply::run(config, &request, overrides, json).await
                }
                Commands::Rollback { repo, action } => rollback::run(&config, &repo, action),
                Commands::Risk {
                    conflicts,
                    resolve,
                    json,
                } => risk::run(config, &conflicts, resolve, json).await,
                Commands::Init { .. } | Commands::Validate => unreachable!("handled above"),
            }
        }
    }
}

/// Logs go to stderr so `--json` output stays parseable.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no configuration file, using defaults");
        return Ok(AppConfig::default());
    }
    AppConfig::load_and_resolve(path).context("failed to load configuration file")
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, AppConfig::sample_toml()).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!(
            "Default configuration written to {}",
            output.display()
        ))
    );
    println!();
    println!("Next steps:");
    println!("  1. Set build_command / test_command under [validation]");
    println!("  2. To use ai resolution, enable [ai] and export PATCHGUARD_AI_API_KEY");
    println!("  3. Validate with: patchguard validate --config {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("{}", style::header("Configuration summary:"));
    println!("  Strategy        : {}", config.apply.strategy);
    println!("  Resolution mode : {}", config.apply.conflict_resolution);
    println!("  Backup root     : {}", config.rollback.backup_dir_name);
    println!("  Max backup age  : {}h", config.rollback.max_age_hours);
    println!(
        "  Build command   : {}",
        config.validation.build_command.as_deref().unwrap_or("not set")
    );
    println!(
        "  Test command    : {}",
        config.validation.test_command.as_deref().unwrap_or("not set")
    );
    if config.ai.enabled {
        println!("  AI endpoint     : {} ({})", config.ai.endpoint, config.ai.model);
        println!(
            "  AI key          : {}",
            if config.ai.api_key.is_some() { "set" } else { "NOT SET" }
        );
    } else {
        println!("  AI resolution   : disabled");
    }
    println!();
    println!("{}", style::success("Configuration is valid."));
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
