//! CodeQuest CLI
//!
//! Lists challenges, lints source files, runs programs interactively through
//! the sandbox, verifies submissions, and serves the browser API.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use codequest_engine::{
    create_router, AppState, CancelToken, Catalog, ChangeLog, Config, EngineError,
    FileProfileStore, Linter, Profile, ProfileStore, ProfileSync, SandboxBackend, Session,
    SyncStatus, TerminalState,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Default port for the HTTP API server.
const DEFAULT_PORT: u16 = 3000;

/// How long `submit` waits for the profile write before exiting.
const SYNC_WAIT: Duration = Duration::from_secs(10);

/// CodeQuest - interactive coding challenges
///
/// Runs learner programs in a remote sandbox, verifies them against
/// reference implementations, and tracks XP, coins and levels.
#[derive(Parser, Debug)]
#[command(name = "codequest")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: codequest.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the sandbox backend
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendArg>,

    /// Override the sandbox service URL
    #[arg(long, value_name = "URL", global = true)]
    sandbox_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the challenges in the catalog
    Challenges,

    /// Lint a source file
    Lint {
        /// Source file to lint
        file: PathBuf,

        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a program, prompting for console input on this terminal
    Run {
        /// Source file to run
        file: PathBuf,

        /// Challenge to run against (default: the first in the catalog)
        #[arg(short = 'C', long, value_name = "ID")]
        challenge: Option<String>,
    },

    /// Verify a solution and record progress on success
    Submit {
        /// Source file to submit
        file: PathBuf,

        /// Challenge id
        #[arg(short = 'C', long, value_name = "ID")]
        challenge: String,

        /// Verify only; leave the profile untouched
        #[arg(long)]
        dry_run: bool,
    },

    /// Serve the HTTP and WebSocket API for the browser editor
    Serve {
        /// Port for the HTTP API server
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Challenge to open first
        #[arg(short = 'C', long, value_name = "ID")]
        challenge: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Http,
    Docker,
}

impl From<BackendArg> for SandboxBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Http => Self::Http,
            BackendArg::Docker => Self::Docker,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(backend) = args.backend {
        config.sandbox.backend = backend.into();
    }
    if let Some(url) = args.sandbox_url {
        config.sandbox.url = url;
    }

    // Re-validate after overrides
    config.validate()?;

    match args.command {
        Command::Challenges => list_challenges(&config).await,
        Command::Lint { file, json } => lint_file(&config, &file, json).await,
        Command::Run { file, challenge } => {
            run_interactive(&config, &file, challenge.as_deref()).await
        }
        Command::Submit {
            file,
            challenge,
            dry_run,
        } => submit_file(&config, &file, &challenge, dry_run).await,
        Command::Serve { port, challenge } => serve(&config, port, challenge.as_deref()).await,
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn list_challenges(config: &Config) -> anyhow::Result<ExitCode> {
    let catalog = load_catalog(config)?;
    let profile = FileProfileStore::new(&config.profile.path)
        .load()
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not read profile; showing no progress");
            Profile::default()
        });
    let policy = config.progression.policy();

    for challenge in catalog.iter() {
        let done = if profile.completed_challenge_ids.contains(&challenge.id) {
            "x"
        } else {
            " "
        };
        let xp = challenge.xp_reward.unwrap_or(policy.default_xp_reward);
        println!(
            "[{done}] {:<24} {:<28} {:<12} {xp} XP",
            challenge.id, challenge.title, challenge.module
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn lint_file(config: &Config, file: &Path, json: bool) -> anyhow::Result<ExitCode> {
    let source = read_source(file).await?;
    let diagnostics = Linter::new(config.language.profile()).lint(&source);

    if json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    } else {
        for d in &diagnostics {
            println!(
                "{}:{}:{}: {}: {}",
                file.display(),
                d.line,
                d.column,
                d.severity,
                d.message
            );
        }
    }

    if codequest_engine::has_blocking(&diagnostics) {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn run_interactive(
    config: &Config,
    file: &Path,
    challenge: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let source = read_source(file).await?;
    let mut session = open_session(config)?;
    if let Some(id) = challenge {
        session.select_challenge_by_id(id)?;
    }
    session.set_source(source)?;
    cancel_on_ctrl_c(session.cancel_token());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut printed = 0;

    let mut outcome = session.run().await?;
    loop {
        let fresh = outcome.transcript.get(printed..).unwrap_or_default();
        stdout.write_all(fresh.as_bytes()).await?;
        stdout.flush().await?;
        printed = outcome.transcript.len();

        if outcome.state != TerminalState::AwaitingInput {
            break;
        }

        let line = stdin.next_line().await?.unwrap_or_default();
        // The terminal already echoed what was typed.
        printed += line.len() + 1;
        outcome = match session.submit_line(&line).await {
            Ok(outcome) => outcome,
            Err(EngineError::SessionClosed) => return Ok(ExitCode::from(130)),
            Err(e) => return Err(e.into()),
        };
    }

    for d in &outcome.diagnostics {
        eprintln!(
            "{}:{}:{}: {}: {}",
            file.display(),
            d.line,
            d.column,
            d.severity,
            d.message
        );
    }

    match outcome.failure {
        None => Ok(ExitCode::SUCCESS),
        Some(class) => {
            tracing::debug!(failure = %class, "Run did not succeed");
            Ok(ExitCode::from(1))
        }
    }
}

async fn submit_file(
    config: &Config,
    file: &Path,
    challenge: &str,
    dry_run: bool,
) -> anyhow::Result<ExitCode> {
    let source = read_source(file).await?;
    let app_cancel = CancelToken::new();

    let mut session = open_session(config)?;
    let sync = if dry_run {
        None
    } else {
        let (profile, sync) = open_profile(config, app_cancel.clone()).await?;
        session = session.with_profile(config.progression.policy(), &profile, sync.clone());
        Some(sync)
    };
    session.select_challenge_by_id(challenge)?;
    session.set_source(source)?;
    cancel_on_ctrl_c(session.cancel_token());

    let outcome = session.submit().await?;
    let report = &outcome.report;

    for (i, test) in report.tests.iter().enumerate() {
        let mark = if test.passed { "pass" } else { "FAIL" };
        println!("  test {}: {mark} ({} ms)", i + 1, test.execution_time_ms);
    }
    println!("{}", report.message);

    if let Some(delta) = &outcome.delta {
        println!(
            "+{} XP, +{} coins. Level {} ({} / {} XP)",
            delta.xp_gained,
            delta.coins_gained,
            delta.economy.level,
            delta.economy.xp,
            delta.economy.next_level_xp
        );
        if delta.levels_gained > 0 {
            println!("Level up!");
        }
    } else if outcome.already_completed && report.passed {
        println!("Already completed; no new rewards.");
    }

    if let Some(error) = &outcome.persistence_error {
        eprintln!("Warning: progress was not saved: {error}");
    }

    if let Some(sync) = sync {
        match tokio::time::timeout(SYNC_WAIT, sync.settled()).await {
            Ok(SyncStatus::Failed { error, pending }) => eprintln!(
                "Warning: {pending} profile change(s) not written yet ({error}); they will be retried next time"
            ),
            Ok(_) => {}
            Err(_) => eprintln!("Warning: profile write still in progress; it will be retried next time"),
        }
    }
    app_cancel.cancel();

    if report.passed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

async fn serve(config: &Config, port: u16, challenge: Option<&str>) -> anyhow::Result<ExitCode> {
    let app_cancel = CancelToken::new();
    let (profile, sync) = open_profile(config, app_cancel.clone()).await?;
    let mut session = open_session(config)?.with_profile(
        config.progression.policy(),
        &profile,
        sync,
    );
    if let Some(id) = challenge {
        session.select_challenge_by_id(id)?;
    }

    let state = AppState::new(session, config.lint_debounce());
    let session = Arc::clone(&state.session);
    let router = create_router(state);

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    println!("CodeQuest API running on http://{addr}");
    println!("Press Ctrl+C to stop");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server error")?;

    session.lock().await.close();
    app_cancel.cancel();
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helpers
// ============================================================================

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Ok(Config::load_from_file(path)?)
        }
        None => Ok(Config::load()?),
    }
}

fn load_catalog(config: &Config) -> anyhow::Result<Catalog> {
    match config.catalog_path() {
        Some(path) => {
            tracing::info!(catalog = %path.display(), "Loading challenge catalog");
            Ok(Catalog::load(&path)?)
        }
        None => Ok(Catalog::builtin()),
    }
}

fn open_session(config: &Config) -> anyhow::Result<Session> {
    let catalog = load_catalog(config)?;
    let sandbox = config
        .sandbox
        .build()
        .with_context(|| format!("Failed to set up the {:?} sandbox", config.sandbox.backend))?;
    tracing::debug!(sandbox = sandbox.name(), "Sandbox ready");

    Ok(Session::new(
        Arc::new(catalog),
        sandbox,
        config.session_settings(),
    )?)
}

/// Loads the profile, replays changes not yet synced, and starts the sync
/// worker.
async fn open_profile(config: &Config, cancel: CancelToken) -> anyhow::Result<(Profile, ProfileSync)> {
    let store = FileProfileStore::new(&config.profile.path);
    let mut profile = store
        .load()
        .await
        .with_context(|| format!("Failed to read profile '{}'", config.profile.path))?;

    let log = ChangeLog::open(&config.profile.change_log)
        .await
        .with_context(|| format!("Failed to open change log '{}'", config.profile.change_log))?;
    log.replay_onto(&mut profile);

    tracing::info!(
        xp = profile.xp,
        level = profile.level,
        completed = profile.completed_challenge_ids.len(),
        "Profile loaded"
    );

    let sync = ProfileSync::spawn(
        Arc::new(store),
        log,
        config.profile.retry.policy(),
        cancel,
    );
    Ok((profile, sync))
}

async fn read_source(file: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read '{}'", file.display()))
}

/// Closes the session on Ctrl+C so an in-flight sandbox call is abandoned.
fn cancel_on_ctrl_c(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}
