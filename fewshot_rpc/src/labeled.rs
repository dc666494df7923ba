use crate::dataset::{sample as sample_demos, seeded_rng, Example, DEFAULT_SEED};
use crate::evaluator::Evaluator;
use crate::models::Module;
use crate::teleprompt::Teleprompter;
use crate::Result;
use async_trait::async_trait;

/// Fills every predictor with raw training examples as demonstrations.
#[derive(Clone)]
pub struct LabeledFewShot {
    k: usize,
    sample: bool,
    evaluator: Evaluator,
}

impl LabeledFewShot {
    pub fn new(k: usize, evaluator: Evaluator) -> Self {
        Self {
            k,
            sample: true,
            evaluator,
        }
    }

    /// `false` takes the first `k` examples instead of a seeded sample.
    pub fn with_sample(mut self, sample: bool) -> Self {
        self.sample = sample;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Reset copy of `student` with `min(k, len(trainset))` demos per
    /// predictor. Each predictor gets its own draw from one RNG seeded with
    /// a fixed value, so repeated calls agree.
    #[tracing::instrument(skip_all, fields(k = self.k, sample = sample, trainset = trainset.len()))]
    pub fn label(&self, student: &Module, trainset: &[Example], sample: bool) -> Module {
        let mut program = student.reset_copy();
        if trainset.is_empty() {
            return program;
        }

        let n = self.k.min(trainset.len());
        let mut rng = seeded_rng(DEFAULT_SEED);
        for predictor in program.predictors_mut() {
            predictor.demos = if sample {
                sample_demos(trainset, n, &mut rng)
            } else {
                trainset[..n].to_vec()
            };
        }
        program
    }
}

#[async_trait]
impl Teleprompter for LabeledFewShot {
    #[tracing::instrument(skip_all)]
    async fn compile(
        &self,
        student: &Module,
        trainset: &[Example],
        _valset: Option<&[Example]>,
    ) -> Result<Module> {
        Ok(self.label(student, trainset, self.sample))
    }

    fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    fn name(&self) -> &'static str {
        "labeled_few_shot"
    }
}
