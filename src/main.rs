use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use privote_operator::config::{OperatorConfig, PollConfig, RunConfig, VoterConfig};
use privote_operator::crypto::{load_or_generate_keypair, public_key_to_hex};
use privote_operator::devnet::DevnetProtocol;
use privote_operator::orchestrator::{Orchestrator, RunContext, SystemClock};
use privote_operator::errors::OperatorError;
use privote_operator::repository::{
    AccountStore, ArtifactRepository, FsAccountStore, FsArtifactRepository,
};
use privote_operator::verification::{self, ObservedTally, TallySource};
use privote_operator::vote::VoteIntent;

#[derive(Parser)]
#[command(author, version, about = "Poll lifecycle operator and tally verifier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a poll through its full lifecycle and verify the results
    Run {
        #[arg(short, long, default_value = "config/operator.toml")]
        config: PathBuf,
        #[arg(long, default_value = "keys/coordinator.toml")]
        coordinator_key: PathBuf,
        /// Override the configured proof artifact directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Skip steps with ordinal less than or equal to this value
        #[arg(long)]
        skip: Option<usize>,
        /// Pause in seconds between lifecycle steps
        #[arg(long)]
        pause: Option<u64>,
        /// Skip steps whose postcondition already holds
        #[arg(long, default_value_t = false)]
        incremental: bool,
        /// Run against an in-process protocol deployment instead of a live
        /// one
        #[arg(long, default_value_t = false)]
        local: bool,
    },
    /// Re-check a persisted tally artifact against the configured ballots
    Verify {
        #[arg(short, long, default_value = "config/operator.toml")]
        config: PathBuf,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Generate a default operator configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/operator.toml")]
        path: PathBuf,
        #[arg(long, default_value = "keys/coordinator.toml")]
        coordinator_key: PathBuf,
    },
    /// Generate a keypair file (e.g. for the coordinator)
    Keygen {
        #[arg(short, long, default_value = "keys/coordinator.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            coordinator_key,
            output_dir,
            skip,
            pause,
            incremental,
            local,
        } => {
            run_poll(
                config,
                coordinator_key,
                output_dir,
                skip,
                pause,
                incremental,
                local,
            )
            .await?
        }
        Commands::Verify { config, output_dir } => verify_artifact(config, output_dir)?,
        Commands::GenerateConfig {
            path,
            coordinator_key,
        } => generate_config(path, coordinator_key)?,
        Commands::Keygen { path } => keygen(path)?,
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_poll(
    config_path: PathBuf,
    coordinator_key: PathBuf,
    output_dir: Option<PathBuf>,
    skip: Option<usize>,
    pause: Option<u64>,
    incremental: bool,
    local: bool,
) -> Result<()> {
    if !config_path.exists() {
        return Err(anyhow!(
            "configuration {:?} not found; run generate-config first",
            config_path
        ));
    }
    let mut config = OperatorConfig::load(&config_path)?;
    if let Some(dir) = output_dir {
        config.run.output_dir = dir;
    }
    if let Some(skip) = skip {
        config.run.skip_steps = skip;
    }
    if let Some(pause) = pause {
        config.run.step_pause_secs = pause;
    }
    if incremental {
        config.run.incremental = true;
    }

    if !local {
        return Err(anyhow!(
            "no live deployment endpoint is wired into this binary; pass --local for an \
             in-process rehearsal or drive a deployment through the library interfaces"
        ));
    }

    let coordinator = load_or_generate_keypair(&coordinator_key)?;
    let protocol = DevnetProtocol::new();
    let artifacts = FsArtifactRepository::new(&config.run.output_dir);
    let accounts = FsAccountStore::new(&config.run.output_dir);
    let orchestrator = Orchestrator::from_run_config(&config.run);
    let ctx = RunContext::new(
        config,
        coordinator,
        Arc::new(protocol.clone()),
        Arc::new(protocol.clone()),
        Arc::new(protocol),
        Arc::new(artifacts),
        Arc::new(accounts),
        Arc::new(SystemClock),
    );

    let outcome = tokio::select! {
        outcome = orchestrator.run(&ctx) => outcome?,
        _ = signal::ctrl_c() => {
            info!("shutdown signal received; aborting remaining steps");
            return Err(OperatorError::Interrupted.into());
        }
    };

    info!(
        completed = outcome.ledger.completed(),
        skipped = outcome.ledger.skipped(),
        "poll lifecycle finished"
    );
    match outcome.report {
        Some(report) => {
            println!("{report}");
            if !report.passed() {
                return Err(anyhow!(
                    "verification failed: published tallies diverge from recomputed expectations"
                ));
            }
        }
        None => info!("run finished without producing a verification report"),
    }
    Ok(())
}

fn verify_artifact(config_path: PathBuf, output_dir: Option<PathBuf>) -> Result<()> {
    let config = OperatorConfig::load(&config_path)?;
    let output_dir = output_dir.unwrap_or_else(|| config.run.output_dir.clone());
    let artifacts = FsArtifactRepository::new(&output_dir);
    let accounts = FsAccountStore::new(&output_dir);

    let artifact = artifacts
        .load_tally()?
        .ok_or_else(|| anyhow!("no tally artifact found under {:?}", output_dir))?;

    // Reconstruct the ballot set. Progress markers in the account store take
    // precedence; without them every configured ballot is assumed cast.
    let records = accounts.load()?;
    let (intents, expected_ballots) = if records.is_empty() {
        let intents = config
            .voters
            .iter()
            .map(|voter| VoteIntent::parse(&voter.votes))
            .collect::<Result<Vec<_>, _>>()?;
        let count = intents.len();
        (intents, count)
    } else {
        let voted: Vec<_> = records.iter().filter(|record| record.voted).collect();
        let expected = voted.len();
        let mut intents = Vec::with_capacity(expected);
        for record in voted {
            if let Some(voter) = config.voters.get(record.account as usize) {
                intents.push(VoteIntent::parse(&voter.votes)?);
            }
        }
        (intents, expected)
    };

    let observed = ObservedTally {
        source: TallySource::Artifact,
        results: artifact.results.tally.clone(),
        spent: Some(artifact.total_spent_voice_credits.spent),
    };
    let report = verification::verify(
        artifact.poll_id,
        config.poll.mode.unwrap_or_default(),
        config.poll.options.len() as u32,
        &intents,
        expected_ballots,
        None,
        Some(observed),
    )?;
    println!("{report}");
    if !report.passed() {
        return Err(anyhow!(
            "verification failed: the tally artifact diverges from recomputed expectations"
        ));
    }
    Ok(())
}

fn generate_config(path: PathBuf, coordinator_key: PathBuf) -> Result<()> {
    let coordinator = load_or_generate_keypair(&coordinator_key)?;
    let config = OperatorConfig {
        poll: PollConfig {
            name: "Example poll".into(),
            options: vec!["Option A".into(), "Option B".into(), "Option C".into()],
            option_info: Vec::new(),
            start_time: 0,
            end_time: 0,
            duration: 300,
            mode: None,
            tree_depths: Default::default(),
            coordinator_public_key: public_key_to_hex(&coordinator.public),
            relayers: Vec::new(),
        },
        run: RunConfig::default(),
        voters: vec![
            VoterConfig {
                votes: "0:5,1:3".into(),
            },
            VoterConfig {
                votes: "1:7,2:2".into(),
            },
        ],
    };
    config.save(&path)?;
    info!(?path, ?coordinator_key, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<()> {
    let keypair = load_or_generate_keypair(&path)?;
    info!(?path, public_key = %public_key_to_hex(&keypair.public), "keypair ready");
    Ok(())
}
