//! groundwork CLI entrypoint.
//!
//! Results go to stdout (text or JSON); logs and prompts go to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use groundwork::cli::{Cli, Commands, OutputFormatter, StateCommands};
use groundwork::config::{find_spec_file, SpecDocument, SpecParser, SpecValidator, StateBackend, ValidationError};
use groundwork::engine::Engine;
use groundwork::error::{GroundworkError, Result};
use groundwork::graph::GraphBuilder;
use groundwork::planner::ExecutionPlan;
use groundwork::provider::{LocalProvider, ProviderRegistry, SANDBOX_DIR};
use groundwork::state::{LocalStateStore, S3StateStore, StateStore, STATE_DIR};

use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Exit code used by `drift` when resources have drifted.
const DRIFT_EXIT_CODE: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `-v` forces debug output; otherwise `GROUNDWORK_LOG` is honored.
fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("GROUNDWORK_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };

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

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let spec_path = resolve_spec_path(cli.spec.as_ref())?;
    let document = load_document(&spec_path, cli.environment.as_deref())?;

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(&document, warnings, &formatter),
        Commands::Plan { out } => {
            let engine = create_engine(&document, &spec_path).await?;
            cmd_plan(&engine, &document, out.as_deref(), &formatter).await
        }
        Commands::Apply { plan, yes } => {
            let engine = create_engine(&document, &spec_path).await?;
            cmd_apply(&engine, &document, plan.as_deref(), yes, &formatter).await
        }
        Commands::Destroy { yes } => {
            let engine = create_engine(&document, &spec_path).await?;
            cmd_destroy(&engine, yes, &formatter).await
        }
        Commands::Drift => {
            let engine = create_engine(&document, &spec_path).await?;
            cmd_drift(&engine, &formatter).await
        }
        Commands::State { command } => {
            let store = open_store(&document, &spec_path).await?;
            cmd_state(store.as_ref(), &document.project.environment, command, &formatter).await
        }
    }
}

/// Validate the specification.
fn cmd_validate(
    document: &SpecDocument,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let mut result = SpecValidator::new().check(document);

    let resources = match GraphBuilder::build_document(document) {
        Ok(graph) => graph.len(),
        Err(e) => {
            result.errors.push(ValidationError {
                field: String::from("resources"),
                message: e.to_string(),
            });
            0
        }
    };

    emit(&formatter.format_validation(document, &result, resources, show_warnings))?;
    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the execution plan.
async fn cmd_plan(
    engine: &Engine,
    document: &SpecDocument,
    out: Option<&Path>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    SpecValidator::new().validate(document)?;
    let plan = engine.plan_document(document).await?;
    emit(&formatter.format_plan(&plan))?;

    if let Some(path) = out {
        std::fs::write(path, plan.to_json()?)?;
        emit(&formatter.format_message(&format!("Plan saved to {}", path.display())))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Apply a plan.
async fn cmd_apply(
    engine: &Engine,
    document: &SpecDocument,
    saved_plan: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let plan = if let Some(path) = saved_plan {
        debug!("Loading saved plan from {}", path.display());
        ExecutionPlan::from_json(&std::fs::read_to_string(path)?)?
    } else {
        SpecValidator::new().validate(document)?;
        engine.plan_document(document).await?
    };

    if plan.is_empty() && saved_plan.is_none() {
        emit(&formatter.format_message("No changes to apply."))?;
        return Ok(ExitCode::SUCCESS);
    }

    emit(&formatter.format_plan(&plan))?;
    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        emit(&formatter.format_message("Apply cancelled."))?;
        return Ok(ExitCode::SUCCESS);
    }

    cancel_on_interrupt(engine);
    let result = engine.apply(&plan).await?;
    emit(&formatter.format_apply(&result))?;

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    engine: &Engine,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let environment = engine.environment().to_string();
    let preview = engine.plan_destroy(&environment).await?;
    if preview.mutation_count() == 0 {
        emit(&formatter.format_message("Nothing to destroy."))?;
        return Ok(ExitCode::SUCCESS);
    }

    emit(&formatter.format_plan(&preview))?;
    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        emit(&formatter.format_message("Destruction cancelled."))?;
        return Ok(ExitCode::SUCCESS);
    }

    cancel_on_interrupt(engine);
    let result = engine.destroy(&environment).await?;
    emit(&formatter.format_apply(&result))?;

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Check for drift.
async fn cmd_drift(engine: &Engine, formatter: &OutputFormatter) -> Result<ExitCode> {
    let report = engine.check_drift(engine.environment()).await?;
    emit(&formatter.format_drift(&report))?;

    Ok(if report.has_drift() {
        ExitCode::from(DRIFT_EXIT_CODE)
    } else {
        ExitCode::SUCCESS
    })
}

/// State management commands.
async fn cmd_state(
    store: &dyn StateStore,
    environment: &str,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    match command {
        StateCommands::Show => match store.load(environment).await? {
            Some(state) => emit(&formatter.format_state(&state))?,
            None => emit(&formatter.format_message("No state found."))?,
        },
        StateCommands::Lock { holder } => {
            let lock = store
                .acquire_lock(environment, holder.as_deref().unwrap_or(""))
                .await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            let target = if force {
                store.get_lock_info(environment).await?.map(|l| l.lock_id)
            } else {
                lock_id
            };

            match target {
                Some(id) => {
                    store.release_lock(environment, &id).await?;
                    emit(&formatter.format_message("State unlocked."))?;
                }
                None if force => emit(&formatter.format_message("State is not locked."))?,
                None => {
                    emit(&formatter.format_message("Please provide --lock-id or use --force"))?;
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the specification file path.
fn resolve_spec_path(spec_path: Option<&PathBuf>) -> Result<PathBuf> {
    spec_path.map_or_else(|| find_spec_file("."), |path| Ok(path.clone()))
}

/// Directory holding the specification file.
fn spec_dir(spec_path: &Path) -> &Path {
    spec_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads `.env`, the document and its environment overrides.
fn load_document(spec_path: &Path, environment: Option<&str>) -> Result<SpecDocument> {
    let parser = SpecParser::new().with_base_path(spec_dir(spec_path));
    parser.load_dotenv()?;

    let mut document = parser.load_with_env(spec_path)?;
    if let Some(environment) = environment {
        debug!("Targeting environment {environment} from the command line");
        document.project.environment = environment.to_string();
    }
    Ok(document)
}

/// Creates the state store configured by the document.
async fn open_store(document: &SpecDocument, spec_path: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match document.state.backend {
        StateBackend::Local => {
            let path = document.state.path.as_ref().map_or_else(
                || spec_dir(spec_path).join(STATE_DIR),
                |p| spec_dir(spec_path).join(p),
            );
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = document
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| GroundworkError::internal("S3 bucket not configured"))?;
            Arc::new(
                S3StateStore::new(
                    bucket,
                    document.state.prefix.as_deref(),
                    document.state.region.as_deref(),
                )
                .await,
            )
        }
    };
    Ok(store)
}

/// Builds the engine with the local sandbox provider for every type.
async fn create_engine(document: &SpecDocument, spec_path: &Path) -> Result<Engine> {
    let store = open_store(document, spec_path).await?;

    let sandbox = document.sandbox.path.as_ref().map_or_else(
        || spec_dir(spec_path).join(SANDBOX_DIR),
        |p| spec_dir(spec_path).join(p),
    );
    let provider = LocalProvider::new(sandbox).with_schemas(&document.schemas);
    let registry = ProviderRegistry::new().with_default(Arc::new(provider));

    Ok(Engine::from_document(document, store, registry))
}

/// Cancels the engine's apply when Ctrl-C is pressed.
fn cancel_on_interrupt(engine: &Engine) {
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            token.cancel();
        }
    });
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
