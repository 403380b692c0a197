//! Stackweave CLI entrypoint.
//!
//! This is the main entrypoint for the stackweave command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stackweave::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use stackweave::config::{
    build_stacks, find_config_file, ConfigParser, ConfigValidator, ProjectFile, StateBackend,
};
use stackweave::error::{ConfigError, Result, StackweaveError};
use stackweave::graph::{stack_order_with, DependencyGraph};
use stackweave::model::Stack;
use stackweave::orchestrator::Orchestrator;
use stackweave::planner::{ActionKind, ExecutorSettings};
use stackweave::provider::ProviderRegistry;
use stackweave::state::{
    generate_holder_id, LocalStateStore, MemoryStateStore, S3StateStore, StateStore, STATE_DIR,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.output);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling; in-flight operations get a grace period");
            watcher.cancel();
        }
    });

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, cancel)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if formatter.is_json() {
                println!("{}", formatter.format_error(&e));
            } else {
                eprint!("{}", formatter.format_error(&e));
            }
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// Logs go to stderr so that command output on stdout stays parseable.
fn init_logging(verbose: bool, output: OutputFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match output {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Preview { detailed } => cmd_preview(config, &cli.stacks, detailed, &formatter).await,
        Commands::Up { yes, parallelism } => {
            cmd_up(config, &cli.stacks, yes, parallelism, cancel, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config, &cli.stacks, yes, cancel, &formatter).await,
        Commands::Outputs { stack } => cmd_outputs(config, &stack, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Validate configuration and stack graphs.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let file = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&file)?;
    let stacks = build_stacks(&file)?;
    for stack in &stacks {
        DependencyGraph::build(stack)?;
    }
    let providers = ProviderRegistry::from_config(&file.project, &file.providers, |name| std::env::var(name).ok())?;
    stack_order_with(&stacks, |stack| providers.stacks_read_by_providers_of(stack))?;

    println!("{}", formatter.format_validation(&result, &stacks, show_warnings));
    Ok(())
}

/// Show what `up` would change.
async fn cmd_preview(
    config_path: Option<&PathBuf>,
    selected: &[String],
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ws = Workspace::load(config_path).await?;
    let plans = ws.orchestrator().preview(selected).await?;
    println!("{}", formatter.format_plans(&plans, detailed));
    Ok(())
}

/// Converge stacks.
async fn cmd_up(
    config_path: Option<&PathBuf>,
    selected: &[String],
    auto_approve: bool,
    parallelism: Option<usize>,
    cancel: CancellationToken,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ws = Workspace::load(config_path).await?;

    let mut settings = ExecutorSettings::from_engine(&ws.file.engine);
    if let Some(parallelism) = parallelism {
        settings.parallelism = parallelism.max(1);
    }
    let orchestrator = ws.orchestrator().with_settings(settings).with_cancellation(cancel);

    if !auto_approve {
        let plans = orchestrator.preview(selected).await?;
        let pending = plans.iter().any(|p| p.count(ActionKind::PendingDependency) > 0);
        if !pending && plans.iter().all(|p| !p.has_changes()) {
            println!("{}", formatter.format_message("No changes to apply."));
            return Ok(());
        }

        eprintln!("{}", formatter.format_plans(&plans, false));
        if !confirm("Do you want to apply these changes? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    let report = orchestrator.up(selected).await?;
    println!("{}", formatter.format_run(&report));
    report.into_result().map(|_| ())
}

/// Destroy stacks.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    selected: &[String],
    auto_approve: bool,
    cancel: CancellationToken,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ws = Workspace::load(config_path).await?;
    let orchestrator = ws
        .orchestrator()
        .with_settings(ExecutorSettings::from_engine(&ws.file.engine))
        .with_cancellation(cancel);

    if !auto_approve {
        eprintln!("The following stacks will be destroyed:");
        for stack in ws.stacks.iter().filter(|s| selected.is_empty() || selected.iter().any(|n| n == s.name())) {
            let records = ws.store.load_stack(stack.name()).await?.records.len();
            eprintln!("  - {} ({records} resources)", stack.name());
        }

        if !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    let report = orchestrator.destroy(selected).await?;
    println!("{}", formatter.format_run(&report));
    report.into_result().map(|_| ())
}

/// Show the published outputs of a stack.
async fn cmd_outputs(config_path: Option<&PathBuf>, stack: &str, formatter: &OutputFormatter) -> Result<()> {
    let ws = Workspace::load(config_path).await?;
    let outputs = ws.store.load_outputs(stack).await?;
    println!("{}", formatter.format_outputs(stack, outputs.as_ref()));
    Ok(())
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let ws = Workspace::load(config_path).await?;
    let store = ws.store.as_ref();

    match command {
        StateCommands::Show { stack } => {
            let state = store.load_stack(&stack).await?;
            println!("{}", formatter.format_state(&state));
        }
        StateCommands::Lock { stack, holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&stack, &holder).await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { stack, lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info(&stack).await? {
                    store.release_lock(&stack, &lock.lock_id).await?;
                    println!("{}", formatter.format_message(&format!("Stack {stack} forcefully unlocked.")));
                } else {
                    println!("{}", formatter.format_message(&format!("Stack {stack} is not locked.")));
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&stack, &id).await?;
                println!("{}", formatter.format_message(&format!("Stack {stack} unlocked.")));
            } else {
                return Err(StackweaveError::internal("Please provide --lock-id or use --force"));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command needs, loaded from the project file.
struct Workspace {
    file: ProjectFile,
    stacks: Vec<Stack>,
    store: Box<dyn StateStore>,
    providers: ProviderRegistry,
}

impl Workspace {
    /// Loads and validates the configuration, then opens state and providers.
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading configuration from: {}", config_file.display());

        let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
        parser.load_dotenv()?;
        let file = parser.load_with_env(&config_file)?;
        ConfigValidator::new().validate(&file)?;

        let stacks = build_stacks(&file)?;
        let store = open_store(&file, &config_file).await?;
        let providers = ProviderRegistry::from_config(&file.project, &file.providers, |name| std::env::var(name).ok())?;

        Ok(Self {
            file,
            stacks,
            store,
            providers,
        })
    }

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(&self.file.project, &self.stacks, self.store.as_ref(), &self.providers)
    }
}

/// Opens the configured state backend.
async fn open_store(file: &ProjectFile, config_file: &Path) -> Result<Box<dyn StateStore>> {
    let state = &file.state;
    Ok(match state.backend {
        StateBackend::Local => {
            let path = state
                .path
                .as_ref()
                .map_or_else(|| base_dir(config_file).join(STATE_DIR), PathBuf::from);
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = state.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 bucket not configured", "state.bucket")
            })?;
            Box::new(S3StateStore::new(bucket, state.prefix.as_deref(), state.region.as_deref()).await?)
        }
        StateBackend::Memory => {
            warn!("Using in-memory state; nothing will persist after this command");
            Box::new(MemoryStateStore::new())
        }
    })
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn base_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}
