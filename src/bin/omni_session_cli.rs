use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use omni_session::persistence::RetryPolicy;
use omni_session::{
    AppState, Dispatch, JsonFileStore, PersistenceGateway, SessionConfig, SessionContext,
    SessionEvent, SimulatedAudioPort, TelemetryHub, VoiceBank,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "omni_session_cli",
    about = "Headless driver for the tutoring session core"
)]
struct Cli {
    /// Progress store (JSON document)
    #[arg(long, default_value = "session_progress.json")]
    store: PathBuf,
    /// Session configuration file; defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,
    /// Use millisecond-scale timings
    #[arg(long)]
    fast: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play one level with scripted answers against the simulated audio port
    Play {
        #[arg(long, default_value_t = 1)]
        level: u32,
        /// Answers in order, e.g. `--answers wrong,right`
        #[arg(long, value_delimiter = ',', default_value = "right")]
        answers: Vec<Answer>,
        /// Voice catalog (JSON); the built-in lines are used when absent
        #[arg(long)]
        voice_catalog: Option<PathBuf>,
        /// Directory holding recorded voice clips
        #[arg(long)]
        clips: Option<PathBuf>,
    },
    /// Print the stored progress record with session totals
    Progress,
    /// Credit eggs through the persistence gateway
    AddEggs {
        #[arg(long)]
        amount: u64,
    },
    /// Print the effective configuration
    DumpConfig,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Answer {
    Right,
    Wrong,
}

#[derive(Serialize)]
struct PlaySummary {
    level: u32,
    eggs: u64,
    next_level: u32,
    final_state: AppState,
    abandoned_tasks: usize,
    persistence_drained: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from_file(path),
        None => SessionConfig::default(),
    };
    if cli.fast {
        config = SessionConfig {
            rewards: config.rewards.clone(),
            ..SessionConfig::fast()
        };
    }

    match cli.command {
        Commands::Play {
            level,
            answers,
            voice_catalog,
            clips,
        } => {
            let voice = match voice_catalog {
                Some(catalog) => {
                    let clips = clips.unwrap_or_else(|| PathBuf::from("."));
                    VoiceBank::load(&catalog, &clips)
                        .with_context(|| format!("loading voice catalog {}", catalog.display()))?
                }
                None => VoiceBank::builtin(),
            };
            run_play(config, cli.store, voice, level, &answers).await
        }
        Commands::Progress => run_progress(config, cli.store).await,
        Commands::AddEggs { amount } => run_add_eggs(config, cli.store, amount).await,
        Commands::DumpConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::from(0))
        }
    }
}

async fn run_play(
    config: SessionConfig,
    store: PathBuf,
    voice: VoiceBank,
    level: u32,
    answers: &[Answer],
) -> Result<ExitCode> {
    let port = Arc::new(SimulatedAudioPort::new(config.audio.speech_ms_per_char));
    let debounce = Duration::from_millis(config.input.debounce_ms);
    let settle = Duration::from_millis(config.director.tutor_timeout_ms)
        + Duration::from_millis(config.director.celebration_ms)
        + Duration::from_secs(5);

    let session = SessionContext::open(
        config,
        port,
        Arc::new(JsonFileStore::new(&store)),
        voice,
    )
    .await
    .with_context(|| format!("opening store {}", store.display()))?;
    session.subscribe(|transition| {
        println!(
            "{:>3}  {:?} -> {:?}",
            transition.sequence, transition.from, transition.to
        );
    });

    let script = async {
        session.dispatch(SessionEvent::Start).await?;
        if session.dispatch(SessionEvent::LevelSelected(level)).await? == Dispatch::Rejected {
            bail!("level {} is locked", level);
        }
        wait_for(&session, AppState::InputActive, settle).await?;

        for answer in answers {
            let correct = matches!(answer, Answer::Right);
            while session.input().is_locked() {
                tokio::time::sleep(debounce / 4).await;
            }
            session
                .dispatch(SessionEvent::AnswerSubmitted { correct })
                .await?;
            if correct {
                wait_for(&session, AppState::MapBrowse, settle).await?;
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let outcome = tokio::select! {
        result = script => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    };

    let final_state = session.current_state();
    let report = session.shutdown().await;
    outcome?;

    let persistence = session.persistence();
    let summary = PlaySummary {
        level,
        eggs: persistence.get_eggs(),
        next_level: persistence.next_level(),
        final_state,
        abandoned_tasks: report.abandoned_tasks,
        persistence_drained: report.persistence_drained,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::from(0))
}

async fn run_progress(config: SessionConfig, store: PathBuf) -> Result<ExitCode> {
    let gateway = open_gateway(&config, &store).await?;
    let record = gateway.snapshot();
    let report = serde_json::json!({
        "stats": record.stats(),
        "progress": record,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::from(0))
}

async fn run_add_eggs(config: SessionConfig, store: PathBuf, amount: u64) -> Result<ExitCode> {
    let gateway = open_gateway(&config, &store).await?;
    let total = gateway
        .add_eggs(amount)
        .await
        .with_context(|| format!("crediting {} eggs", amount))?;
    gateway
        .drain(Duration::from_millis(config.shutdown.persistence_timeout_ms))
        .await;
    println!("{}", total);
    Ok(ExitCode::from(0))
}

async fn open_gateway(config: &SessionConfig, store: &Path) -> Result<PersistenceGateway> {
    PersistenceGateway::open(
        Arc::new(JsonFileStore::new(store)),
        RetryPolicy::from_config(&config.persistence),
        Arc::new(TelemetryHub::default()),
    )
    .await
    .with_context(|| format!("opening store {}", store.display()))
}

async fn wait_for(session: &SessionContext, state: AppState, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while session.current_state() != state {
        if session.current_state() == AppState::Error {
            bail!("session entered the error state");
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "timed out waiting for {:?} (still {:?})",
                state,
                session.current_state()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
