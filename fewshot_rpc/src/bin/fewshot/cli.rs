use clap::{Parser, Subcommand, ValueEnum};
use fewshot_rpc::config::DEFAULT_HOST_URL;
use fewshot_rpc::Settings;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "fewshot", version, about = "Few-shot demonstration optimizer")]
pub struct Cli {
    /// Rollout service base URL.
    #[arg(long, global = true, env = "HOST_URL", default_value = DEFAULT_HOST_URL)]
    pub host_url: String,

    /// Per-request HTTP timeout in milliseconds.
    #[arg(long, global = true, env = "FEWSHOT_HTTP_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OptimizerKind {
    Labeled,
    Bootstrap,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Compile a student program and print (or send) the result.
    ///
    /// The job file holds `{student, trainset, valset?, config?}`.
    Compile {
        #[arg(long, value_enum, default_value = "bootstrap")]
        optimizer: OptimizerKind,

        #[arg(long)]
        job: PathBuf,

        /// Submit the compiled program to `{host}/send` and print the reply.
        #[arg(long)]
        send: bool,

        /// Write output here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Generate candidate demo sets per predictor.
    DemoSets {
        #[arg(long)]
        job: PathBuf,

        #[arg(long, default_value = "10")]
        num_sets: usize,

        #[arg(long)]
        out: Option<PathBuf>,
    },
}

impl Cli {
    /// Connection settings from the resolved flags. Validation happens when
    /// the client is built.
    pub fn settings(&self) -> Settings {
        Settings {
            timeout: self.timeout_ms.map(Duration::from_millis),
            ..Settings::new(self.host_url.as_str())
        }
    }
}
