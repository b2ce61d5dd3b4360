//! Stackwright CLI entrypoint.
//!
//! This is the main entrypoint for the stackwright command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackwright::backend::{ContextResolver, HttpBackend};
use stackwright::cli::{
    Cli, Commands, ContextCommands, ContextKeyArgs, OutputFormat, OutputFormatter, RunArgs,
    StateCommands,
};
use stackwright::config::{find_config_file, ConfigParser, ConfigValidator, StackConfig, StateBackend};
use stackwright::error::{ConfigError, Result, StackwrightError};
use stackwright::orchestrator::{ApplyMode, Orchestrator};
use stackwright::state::{
    ContextCache, ContextKey, LocalStateStore, S3StateStore, StateStore, STATE_DIR,
};
use stackwright::unit::{DeployableUnit, EnvironmentKey};

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point. Returns `false` when the command ran but did
/// not succeed.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { mode, detailed } => {
            cmd_plan(config, mode.into(), detailed, &formatter).await
        }
        Commands::Apply(args) => cmd_run(config, ApplyMode::Deploy, &args, cli.output).await,
        Commands::Destroy(args) => cmd_run(config, ApplyMode::Destroy, &args, cli.output).await,
        Commands::Rollback(args) => cmd_run(config, ApplyMode::Rollback, &args, cli.output).await,
        Commands::Status => cmd_status(config, &formatter).await,
        Commands::Context { command } => cmd_context(config, command, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Validate the project file.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<bool> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating project: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&result, show_warnings));

    if result.is_valid() && !formatter.is_json() {
        eprintln!("Project: {}", config.project.name);
        eprintln!("Units: {}", config.units.len());
    }

    Ok(result.is_valid())
}

/// Show the change sets a run would submit.
async fn cmd_plan(
    config_path: Option<&Path>,
    mode: ApplyMode,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let project = load_project(config_path).await?;
    let orchestrator = project.orchestrator()?;

    let plan = orchestrator.plan_mode(project.units, mode).await?;
    println!("{}", formatter.format_plan(&plan, detailed));

    Ok(plan.error_count() == 0)
}

/// Drive a deploy, destroy or rollback run.
async fn cmd_run(config_path: Option<&Path>, mode: ApplyMode, args: &RunArgs, format: OutputFormat) -> Result<bool> {
    let formatter = OutputFormatter::new(format);
    let project = load_project(config_path).await?;
    let orchestrator = project.orchestrator()?;

    let mut options = project.config.orchestrator.apply_options();
    options.dry_run = args.dry_run;
    if let Some(limit) = args.concurrency {
        options.concurrency_limit = limit;
    }
    if args.no_rollback {
        options.rollback_on_failure = false;
    }

    if !args.yes && !args.dry_run {
        let plan = orchestrator.plan_mode(project.units.clone(), mode).await?;
        println!("{}", formatter.format_plan(&plan, false));

        if plan.is_empty() {
            eprintln!("Nothing to do.");
            return Ok(true);
        }
        if !confirm(mode)? {
            eprintln!("Run cancelled.");
            return Ok(true);
        }
    }

    let cancel = orchestrator.cancellation().clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight units");
            cancel.cancel();
        }
    });

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        let formatter = OutputFormatter::new(format);
        loop {
            match events.recv().await {
                Ok(event) if !formatter.is_json() => eprintln!("{}", formatter.format_event(&event)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Progress printer skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = orchestrator.apply(project.units, mode, options).await;

    // Closing the channel lets the printer drain what is left.
    drop(orchestrator);
    if let Err(e) = printer.await {
        debug!("Progress printer ended abnormally: {e}");
    }
    ctrl_c.abort();

    let report = result?;
    println!("{}", formatter.format_report(&report));

    Ok(report.is_success())
}

/// Show recorded state for every unit of the project.
async fn cmd_status(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<bool> {
    let project = load_project(config_path).await?;

    let mut records = Vec::with_capacity(project.units.len());
    for unit in &project.units {
        records.push(project.store.load_record(&unit.id, &unit.environment).await?);
    }

    println!("{}", formatter.format_status(&project.units, &records));
    if !formatter.is_json() {
        let lock = project.store.get_lock_info().await?;
        eprintln!("{}", formatter.format_lock(lock.as_ref()));
    }

    Ok(true)
}

/// Context cache commands.
async fn cmd_context(
    config_path: Option<&Path>,
    command: ContextCommands,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let project = load_project(config_path).await?;
    let cache = ContextCache::new(Arc::clone(&project.store));

    match command {
        ContextCommands::List => {
            println!("{}", formatter.format_context(&cache.entries().await?));
        }
        ContextCommands::Invalidate(args) => {
            let key = context_key(&project.config, args)?;
            if cache.invalidate(&key).await? {
                eprintln!("Context {key} marked stale.");
            } else {
                eprintln!("No context entry stored for {key}.");
            }
        }
        ContextCommands::Set { key, value, overwrite } => {
            let key = context_key(&project.config, key)?;
            let value = context_value(&key, &value)?;
            cache.put(&key, value, overwrite).await?;
            eprintln!("Context {key} stored.");
        }
    }

    Ok(true)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let project = load_project(config_path).await?;
    let store = &project.store;

    match command {
        StateCommands::Show { unit } => {
            let unit = project.unit(&unit)?;
            match store.load_record(&unit.id, &unit.environment).await? {
                Some(record) => println!("{}", formatter.format_record(&record)),
                None => eprintln!("No state recorded for {} in {}.", unit.id, unit.environment),
            }
        }
        StateCommands::Lock => {
            let lock = store.get_lock_info().await?;
            println!("{}", formatter.format_lock(lock.as_ref()));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(false);
            }
        }
    }

    Ok(true)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// A loaded and validated project.
struct Project {
    config: StackConfig,
    config_file: PathBuf,
    units: Vec<DeployableUnit>,
    store: Arc<dyn StateStore>,
}

impl Project {
    /// Builds an orchestrator talking to the configured backend.
    fn orchestrator(&self) -> Result<Orchestrator> {
        debug!("Using backend {} for {}", self.config.backend.url, self.config_file.display());
        let backend = Arc::new(HttpBackend::from_env(
            &self.config.backend.url,
            self.config.backend.timeout_secs,
        )?);

        let resolver: Arc<dyn ContextResolver> = backend.clone();

        Ok(Orchestrator::new(Arc::clone(&self.store), backend, resolver)
            .with_diff_engine(self.config.diff_engine()))
    }

    /// Finds a unit by id.
    fn unit(&self, id: &str) -> Result<&DeployableUnit> {
        self.units.iter().find(|u| u.id == id).ok_or_else(|| {
            ConfigError::validation(format!("Unknown unit '{id}'"), "unit").into()
        })
    }
}

/// Resolves the project file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Directory holding the project file.
fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the project and opens its state store.
async fn load_project(config_path: Option<&Path>) -> Result<Project> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading project from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    let units = config.deployable_units()?;

    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(&config_file).join(STATE_DIR), PathBuf::from);
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| StackwrightError::internal("S3 bucket not configured"))?;
            Arc::new(
                S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref())
                    .await?,
            )
        }
    };
    info!("Using {} state store", store.backend_type());

    Ok(Project {
        config,
        config_file,
        units,
        store,
    })
}

/// Builds a context key, filling the environment from the project.
fn context_key(config: &StackConfig, args: ContextKeyArgs) -> Result<ContextKey> {
    let account = args
        .account
        .or_else(|| config.project.account.clone())
        .ok_or_else(|| ConfigError::validation("No account given and the project has none", "account"))?;
    let region = args
        .region
        .or_else(|| config.project.region.clone())
        .ok_or_else(|| ConfigError::validation("No region given and the project has none", "region"))?;

    Ok(args
        .params
        .into_iter()
        .fold(ContextKey::new(args.provider, EnvironmentKey::new(account, region)), |key, (k, v)| {
            key.with_param(k, v)
        }))
}

/// Parses a context value given on the command line as JSON.
fn context_value(key: &ContextKey, raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| {
        ConfigError::validation(format!("Context value for {key} is not valid JSON: {e}"), "value").into()
    })
}

/// Asks for confirmation on stderr.
fn confirm(mode: ApplyMode) -> Result<bool> {
    let (prompt, expected) = match mode {
        ApplyMode::Destroy => ("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy"),
        ApplyMode::Deploy | ApplyMode::Rollback => ("Do you want to run this plan? [y/N]: ", "y"),
    };

    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}
