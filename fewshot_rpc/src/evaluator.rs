use crate::client::RolloutClient;
use crate::config::Settings;
use crate::dataset::{sample, Example};
use crate::models::{Lm, Module, RolloutRequest, RolloutResponse};
use crate::{Result, RolloutHarness};
use rand::Rng;
use serde_json::Value;
use std::sync::{Arc, RwLock};

static GLOBAL_HARNESS: RwLock<Option<Arc<dyn RolloutHarness>>> = RwLock::new(None);

/// Routes every `Evaluator` without its own harness to `harness` instead of
/// the network.
pub fn set_global_harness(harness: Arc<dyn RolloutHarness>) {
    tracing::info!(harness = harness.name(), "global rollout harness installed");
    *GLOBAL_HARNESS.write().unwrap_or_else(|e| e.into_inner()) = Some(harness);
}

pub fn clear_global_harness() {
    *GLOBAL_HARNESS.write().unwrap_or_else(|e| e.into_inner()) = None;
}

fn global_harness() -> Option<Arc<dyn RolloutHarness>> {
    GLOBAL_HARNESS.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Runs candidate programs on examples: through a local harness when one is
/// registered, otherwise through the rollout service.
#[derive(Clone)]
pub struct Evaluator {
    client: RolloutClient,
    harness: Option<Arc<dyn RolloutHarness>>,
}

impl Evaluator {
    pub fn new(client: RolloutClient) -> Self {
        Self {
            client,
            harness: None,
        }
    }

    #[tracing::instrument(skip_all)]
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(RolloutClient::from_settings(settings)?))
    }

    #[tracing::instrument(skip_all)]
    pub fn from_env() -> Result<Self> {
        Self::from_settings(&Settings::from_env()?)
    }

    /// Harness for this evaluator only; it wins over the global one.
    pub fn with_harness(mut self, harness: Arc<dyn RolloutHarness>) -> Self {
        self.harness = Some(harness);
        self
    }

    pub fn client(&self) -> &RolloutClient {
        &self.client
    }

    /// One harness call or one network call per invocation; batch examples
    /// into a single call where possible.
    #[tracing::instrument(skip_all, fields(candidates = candidates.len(), examples = examples.len(), trace = trace))]
    pub async fn evaluate(
        &self,
        candidates: &[Module],
        examples: &[Example],
        trace: bool,
        lm: Option<&Lm>,
    ) -> Result<RolloutResponse> {
        if let Some(harness) = self.harness.clone().or_else(global_harness) {
            tracing::debug!(harness = harness.name(), "evaluating through local harness");
            return harness.evaluate(candidates, examples, trace, lm).await;
        }

        let req = RolloutRequest {
            candidates: candidates.to_vec(),
            examples: examples.to_vec(),
            trace,
            lm: lm.cloned(),
        };
        let resp = self.client.rollout(&req).await?;
        if let Some(usage) = resp.total_usage() {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "rollout usage"
            );
        }
        Ok(resp)
    }

    /// Submits a final program to the service.
    #[tracing::instrument(skip_all)]
    pub async fn send(&self, program: &Module) -> Result<Value> {
        self.client.send(program).await
    }
}

/// Random subset of `min(batch_size, len)` examples.
pub fn create_minibatch<R: Rng + ?Sized>(trainset: &[Example], batch_size: usize, rng: &mut R) -> Vec<Example> {
    sample(trainset, batch_size, rng)
}

/// Evaluates on the whole trainset when it fits in one batch, otherwise on a
/// random minibatch.
#[tracing::instrument(skip_all, fields(batch_size = batch_size, trainset = trainset.len()))]
pub async fn eval_candidate_program<R: Rng + ?Sized>(
    batch_size: usize,
    trainset: &[Example],
    candidate: &Module,
    evaluator: &Evaluator,
    rng: &mut R,
) -> Result<RolloutResponse> {
    if batch_size >= trainset.len() {
        return evaluator
            .evaluate(std::slice::from_ref(candidate), trainset, false, None)
            .await;
    }
    let minibatch = create_minibatch(trainset, batch_size, rng);
    evaluator
        .evaluate(std::slice::from_ref(candidate), &minibatch, false, None)
        .await
}
