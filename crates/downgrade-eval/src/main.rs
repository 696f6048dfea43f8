use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use downgrade_eval::config::{Config, FeedbackConfig};
use downgrade_eval::{
    default_parallelism, eval_multi_feedback_to_json, eval_multi_to_json, RunOptions,
};
use feedback_sim::RerunnableScenario;

#[derive(Parser)]
#[command(name = "eval-downgrade", version)]
#[command(about = "Monte-Carlo evaluation of HIPRI/LOPRI downgrade algorithms")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sweep usage samplers and host selectors against exact knowledge
    Sim(SweepArgs),
    /// Sweep closed-loop feedback-control scenarios
    FeedbackSim(SweepArgs),
    /// Re-run one recorded scenario and dump its per-iteration records
    RerunScenario {
        /// Path to a JSON RerunnableScenario
        #[arg(short, long)]
        config: PathBuf,
        /// Output path for per-iteration records (JSON, one per line)
        #[arg(short, long, default_value = "rerun-records.json")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct SweepArgs {
    /// Path to the sweep config (JSON)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Output path for results (JSON, one record per line)
    #[arg(short, long, default_value = "sim-results.json")]
    output: PathBuf,

    /// Number of Monte-Carlo runs per instance
    #[arg(long, default_value_t = 100)]
    runs: usize,

    /// Max shards in flight (defaults to the number of CPUs)
    #[arg(long)]
    parallelism: Option<usize>,
}

impl SweepArgs {
    fn run_options(&self, base_seed: u64) -> RunOptions {
        RunOptions {
            num_runs: self.runs,
            parallelism: self.parallelism.unwrap_or_else(default_parallelism),
            base_seed,
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let f = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(f))
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set up logging")?;

    match cli.command {
        Command::Sim(args) => {
            let config: Config = load_json(&args.config)?;
            let instances = config.enumerate().context("invalid config")?;
            info!(
                "running {} instances with {} runs each",
                instances.len(),
                args.runs
            );
            let out = File::create(&args.output)
                .with_context(|| format!("failed to create {}", args.output.display()))?;
            let start = Instant::now();
            eval_multi_to_json(&instances, &args.run_options(config.base_seed), out)
                .context("evaluation failed")?;
            info!("run time = {:?}", start.elapsed());
        }
        Command::FeedbackSim(args) => {
            let config: FeedbackConfig = load_json(&args.config)?;
            let instances = config.enumerate().context("invalid config")?;
            info!(
                "running {} instances with {} runs each",
                instances.len(),
                args.runs
            );
            let out = File::create(&args.output)
                .with_context(|| format!("failed to create {}", args.output.display()))?;
            let start = Instant::now();
            eval_multi_feedback_to_json(&instances, &args.run_options(config.base_seed), out)
                .context("evaluation failed")?;
            info!("run time = {:?}", start.elapsed());
        }
        Command::RerunScenario { config, output } => {
            let scenario: RerunnableScenario = load_json(&config)?;
            let out = File::create(&output)
                .with_context(|| format!("failed to create {}", output.display()))?;
            let start = Instant::now();
            scenario.run(out).context("scenario run failed")?;
            info!("run time = {:?}", start.elapsed());
            println!("=== SUMMARY ===");
            println!("{}", serde_json::to_string_pretty(&scenario.summary())?);
        }
    }
    Ok(())
}
