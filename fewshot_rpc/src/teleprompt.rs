use crate::dataset::Example;
use crate::evaluator::Evaluator;
use crate::models::Module;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A demonstration optimizer ("teleprompter").
///
/// `compile` never mutates `student`; it returns a new program.
#[async_trait]
pub trait Teleprompter: Send + Sync {
    async fn compile(
        &self,
        student: &Module,
        trainset: &[Example],
        valset: Option<&[Example]>,
    ) -> Result<Module>;

    /// Evaluator used for rollouts and for submitting results.
    fn evaluator(&self) -> &Evaluator;

    fn name(&self) -> &'static str;

    /// Compiles, then submits the compiled program to the service. Nothing
    /// is sent when compile fails.
    #[tracing::instrument(skip_all)]
    async fn compile_and_send(
        &self,
        student: &Module,
        trainset: &[Example],
        valset: Option<&[Example]>,
    ) -> Result<Value> {
        let compiled = self.compile(student, trainset, valset).await?;
        self.evaluator().send(&compiled).await
    }
}
