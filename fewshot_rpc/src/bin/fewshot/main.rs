mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, OptimizerKind};
use fewshot_rpc::{
    create_n_fewshot_demo_sets, BootstrapConfig, BootstrapFewShot, DemoSetConfig, Evaluator,
    Example, LabeledFewShot, Module, Teleprompter,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct Job {
    student: Module,
    trainset: Vec<Example>,
    #[serde(default)]
    valset: Option<Vec<Example>>,
    #[serde(default)]
    config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LabeledJobConfig {
    k: usize,
    sample: bool,
}

impl Default for LabeledJobConfig {
    fn default() -> Self {
        Self { k: 16, sample: true }
    }
}

fn config_or_default<T: serde::de::DeserializeOwned + Default>(raw: &serde_json::Value) -> anyhow::Result<T> {
    if raw.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(raw.clone()).context("invalid job config")
}

// JSON logs on stderr; stdout carries the command's output.
fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing already initialized: {e}"))
}

async fn read_job(path: &Path) -> anyhow::Result<Job> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading job file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing job file {}", path.display()))
}

async fn write_output(out: Option<PathBuf>, value: &impl serde::Serialize) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("writing {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let settings = cli.settings();
    let evaluator = Evaluator::from_settings(&settings)?;
    tracing::info!(host_url = %settings.host_url, "rollout service configured");

    match cli.command {
        Commands::Compile {
            optimizer,
            job,
            send,
            out,
        } => {
            let job = read_job(&job).await?;
            let teleprompter: Box<dyn Teleprompter> = match optimizer {
                OptimizerKind::Labeled => {
                    let cfg: LabeledJobConfig = config_or_default(&job.config)?;
                    Box::new(LabeledFewShot::new(cfg.k, evaluator).with_sample(cfg.sample))
                }
                OptimizerKind::Bootstrap => {
                    let cfg: BootstrapConfig = config_or_default(&job.config)?;
                    Box::new(BootstrapFewShot::new(cfg, evaluator)?)
                }
            };
            tracing::info!(teleprompter = teleprompter.name(), "compiling");

            let valset = job.valset.as_deref();
            if send {
                let reply = teleprompter
                    .compile_and_send(&job.student, &job.trainset, valset)
                    .await?;
                write_output(out, &reply).await?;
            } else {
                let compiled = teleprompter
                    .compile(&job.student, &job.trainset, valset)
                    .await?;
                write_output(out, &compiled).await?;
            }
        }
        Commands::DemoSets { job, num_sets, out } => {
            let job = read_job(&job).await?;
            let cfg: DemoSetConfig = config_or_default(&job.config)?;
            let sets =
                create_n_fewshot_demo_sets(&job.student, num_sets, &job.trainset, &cfg, &evaluator)
                    .await?;
            write_output(out, &sets).await?;
        }
    }
    Ok(())
}
