//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use docvault_artifacts::{FsVault, OutlineRenderer};
use docvault_core::{
    BuildEngine, BuildOutcome, BuildReport, BuildRequest, CancelToken, ProgressReporter,
    SilentProgress, TaskResult,
};
use docvault_discovery::FsScanner;
use docvault_shared::{
    AppConfig, BuildConfig, FingerprintStore, UnitId, init_config, load_config,
};
use docvault_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// DocVault: incremental documentation builds.
#[derive(Parser)]
#[command(
    name = "docvault",
    version,
    about = "Render a Python source tree into a Markdown vault, rebuilding only what changed.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Project root holding docvault.toml.
    #[arg(short = 'C', long, default_value = ".", global = true)]
    pub project: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Bring the vault up to date with the sources.
    Build {
        /// Only build these units and what depends on them (repeatable).
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Rebuild every unit in scope, ignoring cached fingerprints.
        #[arg(long)]
        force: bool,

        /// Parallel workers (overrides the config file).
        #[arg(short, long)]
        workers: Option<usize>,

        /// Print the build report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show what the fingerprint store knows about the last builds.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Forget every fingerprint so the next build starts from scratch.
    Clean {
        /// Also delete the vault directory.
        #[arg(long)]
        vault: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write docvault.toml with defaults into the project root.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so `--json`
/// output on stdout stays parseable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docvault=warn",
        1 => "docvault=info",
        2 => "docvault=debug",
        _ => "docvault=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command and return the process exit code.
pub(crate) async fn run(cli: Cli) -> Result<i32> {
    let project = cli.project;
    match cli.command {
        Command::Build {
            targets,
            force,
            workers,
            json,
        } => cmd_build(&project, targets, force, workers, json).await,
        Command::Status { json } => cmd_status(&project, json).await.map(|()| 0),
        Command::Clean { vault } => cmd_clean(&project, vault).await.map(|()| 0),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(&project).map(|()| 0),
            ConfigAction::Show => cmd_config_show(&project).map(|()| 0),
        },
    }
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

async fn cmd_build(
    project: &Path,
    targets: Vec<String>,
    force: bool,
    workers: Option<usize>,
    json: bool,
) -> Result<i32> {
    let config = load_config(project)?;
    let mut build_config = BuildConfig::try_from(&config)?;
    if let Some(workers) = workers {
        build_config.workers = workers;
    }

    let state_path = project.join(&config.project.state_file);
    let storage = Storage::open_or_recover(&state_path).await?;
    let recovered = storage.recovered();

    let vault = FsVault::from_config(project, &config.project);
    vault.sweep()?;
    let scanner = FsScanner::from_config(project, &config.project);

    let engine = BuildEngine::new(
        storage,
        Arc::new(scanner),
        Arc::new(OutlineRenderer),
        Arc::new(vault),
        build_config,
    )
    .with_recovered_store(recovered);

    let request = BuildRequest {
        targets: (!targets.is_empty()).then(|| targets.into_iter().map(UnitId::from).collect()),
        force,
    };

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; letting in-flight units finish");
            on_interrupt.cancel();
        }
    });

    info!(
        project = %project.display(),
        workers = engine.config().workers,
        force,
        "starting build"
    );

    let report = if json {
        engine.build(&request, &cancel, &SilentProgress).await?
    } else {
        let progress = CliProgress::new();
        engine.build(&request, &cancel, &progress).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.outcome().exit_code())
}

fn print_report(report: &BuildReport) {
    let headline = match report.outcome() {
        BuildOutcome::Complete => "Build complete",
        BuildOutcome::Partial if report.cancelled => "Build cancelled",
        BuildOutcome::Partial => "Build finished with failures",
        BuildOutcome::Failed => "Build failed",
    };

    println!();
    println!("  {headline}");
    println!("  Rebuilt:  {}", report.rebuilt);
    println!("  Cached:   {}", report.skipped_cached);
    println!("  Failed:   {}", report.failed);
    println!("  Skipped:  {}", report.skipped);
    println!("  Deleted:  {}", report.deleted);
    println!("  Time:     {:.1}s", report.wall_time.as_secs_f64());

    if !report.failures.is_empty() {
        println!();
        for failed in &report.failures {
            println!("  ✗ {}: {}", failed.unit_id, failed.failure);
        }
    }
    for cycle in &report.cycles {
        let mut path: Vec<&str> = cycle.iter().map(UnitId::as_str).collect();
        if let Some(first) = path.first().copied() {
            path.push(first);
        }
        println!("  ↻ dependency cycle: {}", path.join(" -> "));
    }
    if !report.corrupt_records.is_empty() {
        println!(
            "  ! {} damaged cache records were ignored",
            report.corrupt_records.len()
        );
    }
    if report.store_recovered {
        println!("  ! the fingerprint store was unreadable and has been reset");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn planned(&self, tasks: usize, cached: usize) {
        self.spinner
            .set_message(format!("Building {tasks} units ({cached} up to date)"));
    }

    fn unit_finished(
        &self,
        unit_id: &UnitId,
        result: &TaskResult,
        completed: usize,
        total: usize,
    ) {
        if let TaskResult::Failed(failure) = result {
            self.spinner.println(format!("  ✗ {unit_id}: {failure}"));
        }
        self.spinner
            .set_message(format!("Building [{completed}/{total}] {unit_id}"));
    }

    fn done(&self, _report: &BuildReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// status / clean
// ---------------------------------------------------------------------------

async fn cmd_status(project: &Path, json: bool) -> Result<()> {
    let config = load_config(project)?;
    let state_path = project.join(&config.project.state_file);
    if !state_path.exists() {
        println!("No builds recorded yet ({} not found).", state_path.display());
        return Ok(());
    }

    let storage = Storage::open_readonly(&state_path).await?;
    let stats = storage.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    println!("  Tracked units:   {}", stats.tracked_units);
    println!("  Failed units:    {}", stats.failed_units.len());
    println!("  Damaged records: {}", stats.corrupt_records);
    println!("  Builds recorded: {}", stats.runs);
    match stats.last_full_build {
        Some(at) => println!("  Last full build: {}", at.to_rfc3339()),
        None => println!("  Last full build: never"),
    }
    if let (Some(at), Some(run)) = (stats.last_run_at, &stats.last_run) {
        println!(
            "  Last build:      {} ({} rebuilt, {} cached, {} failed, {} skipped, {} deleted{})",
            at.to_rfc3339(),
            run.rebuilt,
            run.skipped_cached,
            run.failed,
            run.skipped,
            run.deleted,
            if run.cancelled { ", cancelled" } else { "" }
        );
    }
    for unit in &stats.failed_units {
        println!("  ✗ {unit}");
    }
    println!();
    Ok(())
}

async fn cmd_clean(project: &Path, remove_vault: bool) -> Result<()> {
    let config = load_config(project)?;
    let state_path = project.join(&config.project.state_file);
    let storage = Storage::open_or_recover(&state_path).await?;
    storage.clear().await?;
    println!("Fingerprint store cleared: {}", state_path.display());

    if remove_vault {
        let vault = FsVault::from_config(project, &config.project);
        let root = vault.root();
        if root.exists() {
            std::fs::remove_dir_all(root)
                .map_err(|e| eyre!("failed to remove {}: {e}", root.display()))?;
            println!("Vault removed: {}", root.display());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(project: &Path) -> Result<()> {
    let path = init_config(project)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(project: &Path) -> Result<()> {
    let config: AppConfig = load_config(project)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
