//! fewshot_rpc: few-shot demonstration optimizers over a remote rollout service.
//!
//! Program execution, scoring and LM calls all happen on the service. This
//! crate only decides which examples become demonstrations and how they are
//! combined into the returned program.

#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod dataset;
pub mod demo_sets;
pub mod evaluator;
pub mod labeled;
pub mod models;
pub mod teleprompt;

pub type Result<T> = std::result::Result<T, FewShotError>;

#[derive(thiserror::Error, Debug)]
pub enum FewShotError {
    #[error("incompatible programs: {0}")]
    IncompatiblePrograms(String),

    #[error("transport error (status {status:?}): {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("rollout response violates schema: {0}")]
    Schema(String),

    /// Returned by [`RolloutHarness`] implementations that fail locally.
    #[error("harness error: {0}")]
    Harness(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<reqwest::Error> for FewShotError {
    fn from(e: reqwest::Error) -> Self {
        FewShotError::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// Local stand-in for the rollout service.
///
/// A harness owns whatever it needs to run programs (a local module, a
/// metric) and answers with the same response shape the service would.
#[async_trait::async_trait]
pub trait RolloutHarness: Send + Sync {
    async fn evaluate(
        &self,
        candidates: &[Module],
        examples: &[Example],
        trace: bool,
        lm: Option<&Lm>,
    ) -> Result<RolloutResponse>;

    fn name(&self) -> &'static str;
}

pub use bootstrap::{BootstrapFewShot, BootstrapReport};
pub use client::RolloutClient;
pub use config::{BootstrapConfig, DemoSetConfig, Settings};
pub use dataset::{Demo, Example};
pub use demo_sets::{create_n_fewshot_demo_sets, create_n_fewshot_demo_sets_with_rng, DemoCandidates};
pub use evaluator::{
    clear_global_harness, create_minibatch, eval_candidate_program, set_global_harness, Evaluator,
};
pub use labeled::LabeledFewShot;
pub use models::{
    Field, FieldKind, FieldRole, FieldType, Lm, ModelType, Module, NamedMap, Prediction, Predictor,
    RolloutRequest, RolloutResponse, RolloutResult, Signature, TraceStep, Usage,
};
pub use teleprompt::Teleprompter;
