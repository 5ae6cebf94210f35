//! Command-line entry point.
//!
//! `solver run` drives one session per challenge directory concurrently and
//! exits with the worst outcome. `solver check` shows how the command policy
//! classifies a command line without running it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use solver::core::types::{SessionMode, SessionState, Verdict};
use solver::engine::{Engine, SessionOutcome};
use solver::exit_codes;
use solver::io::challenge::{DirSink, load_challenge, read_transcript};
use solver::io::config::{EngineConfig, load_config, write_config};
use solver::io::human::StdinHuman;
use solver::io::policy::load_policy;
use solver::io::prompt::TemplatePrompts;
use solver::io::provider::build_provider;
use solver::logging;

const DEFAULT_CONFIG: &str = "solver.toml";

#[derive(Parser)]
#[command(
    name = "solver",
    version,
    about = "LLM-driven capture-the-flag solver"
)]
struct Cli {
    /// Engine configuration file. Defaults apply when it does not exist.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Auto,
    Hitl,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => SessionMode::Auto,
            ModeArg::Hitl => SessionMode::Hitl,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Solve one or more challenge directories concurrently.
    Run {
        #[arg(required = true)]
        challenges: Vec<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = ModeArg::Auto)]
        mode: ModeArg,
    },
    /// Continue a finished session from its transcript as a new session.
    Resume { transcript: PathBuf },
    /// Classify a command line against the policy without running it.
    Check {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the effective configuration.
    Config {
        /// Also write it back to the config path, creating the file if needed.
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { challenges, mode } => cmd_run(&cli.config, &challenges, mode.into()),
        Command::Resume { transcript } => cmd_resume(&cli.config, &transcript),
        Command::Check { command, args } => cmd_check(&cli.config, &command, &args),
        Command::Config { write } => cmd_config(&cli.config, write),
    }
}

fn build_engine(config: EngineConfig) -> Result<Engine> {
    let provider_config = config.provider.resolve()?;
    let provider = build_provider(&provider_config)?;
    let policy = load_policy(config.policy_path.as_deref())?;
    let prompts = Arc::new(TemplatePrompts::new(config.prompts_dir.as_deref())?);
    let sink = Arc::new(DirSink::new(config.output_dir.clone()));
    Ok(Engine::new(config, provider, policy, prompts, Arc::new(StdinHuman::default()))?.with_sink(sink))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling sessions");
            token.cancel();
        }
    });
}

fn cmd_run(config_path: &Path, dirs: &[PathBuf], mode: SessionMode) -> Result<i32> {
    let config = load_config(config_path)?;
    let challenges = dirs
        .iter()
        .map(|dir| load_challenge(dir))
        .collect::<Result<Vec<_>>>()?;
    let engine = Arc::new(build_engine(config)?);

    runtime()?.block_on(async move {
        let cancel = CancellationToken::new();
        cancel_on_interrupt(cancel.clone());

        let mut sessions = JoinSet::new();
        for challenge in challenges {
            let engine = Arc::clone(&engine);
            let token = cancel.child_token();
            sessions.spawn(async move { engine.run_session(challenge, mode, token).await });
        }

        let mut states = Vec::new();
        while let Some(joined) = sessions.join_next().await {
            let outcome = joined.context("session task panicked")??;
            print_outcome(&outcome)?;
            states.push(outcome.state());
        }
        Ok(exit_code_for(&states))
    })
}

fn cmd_resume(config_path: &Path, transcript_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let prior = read_transcript(transcript_path)?;
    let engine = build_engine(config)?;

    runtime()?.block_on(async move {
        let cancel = CancellationToken::new();
        cancel_on_interrupt(cancel.clone());
        let outcome = engine.resume(&prior, cancel).await?;
        print_outcome(&outcome)?;
        Ok(exit_code_for(&[outcome.state()]))
    })
}

fn cmd_check(config_path: &Path, command: &str, args: &[String]) -> Result<i32> {
    let config = load_config(config_path)?;
    let policy = load_policy(config.policy_path.as_deref())?;
    let decision = policy.classify(command, args);
    println!(
        "{}",
        serde_json::to_string_pretty(&decision).context("serialize decision")?
    );
    Ok(match decision.verdict {
        Verdict::Deny => exit_codes::INVALID,
        Verdict::Allow | Verdict::AllowAudit => exit_codes::OK,
    })
}

fn cmd_config(config_path: &Path, write: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    if write {
        write_config(config_path, &config)?;
        eprintln!("wrote {}", config_path.display());
    }
    print!(
        "{}",
        toml::to_string_pretty(&config).context("serialize config toml")?
    );
    let var = config.provider.api_key_env();
    match config.provider.resolve() {
        Ok(resolved) => println!("\n# resolved provider\n# {resolved:?}"),
        Err(_) => println!("\n# ${var} is not set; `solver run` will fail"),
    }
    Ok(exit_codes::OK)
}

fn print_outcome(outcome: &SessionOutcome) -> Result<()> {
    let line = json!({
        "challenge": outcome.transcript.challenge.name,
        "session": outcome.transcript.session_id,
        "state": outcome.state(),
        "reason": outcome.reason,
        "flag": outcome.transcript.accepted_flag(),
        "steps": outcome.transcript.steps,
        "transcript": outcome.saved_to,
    });
    println!("{}", serde_json::to_string(&line).context("serialize outcome")?);
    Ok(())
}

/// Worst outcome wins: aborted, then failed, then ok.
fn exit_code_for(states: &[SessionState]) -> i32 {
    if states.contains(&SessionState::Aborted) {
        exit_codes::ABORTED
    } else if states.iter().any(|s| *s != SessionState::Done) {
        exit_codes::FAILED
    } else {
        exit_codes::OK
    }
}
