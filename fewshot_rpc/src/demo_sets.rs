use crate::bootstrap::BootstrapFewShot;
use crate::config::DemoSetConfig;
use crate::dataset::{seeded_rng, Demo, Example};
use crate::evaluator::Evaluator;
use crate::labeled::LabeledFewShot;
use crate::models::Module;
use crate::teleprompt::Teleprompter;
use crate::Result;
use rand::prelude::*;
use std::collections::BTreeMap;

/// Candidate demo lists per predictor, keyed by the predictor's position in
/// the student program.
pub type DemoCandidates = BTreeMap<usize, Vec<Vec<Demo>>>;

/// Number of fixed-kind sets leading every run: zero-shot, labels-only,
/// unshuffled bootstrap.
const FIXED_SETS: usize = 3;

/// Builds `num_candidate_sets` alternative demo sets for every predictor of
/// `student`, seeding the shared RNG from `cfg.seed`.
pub async fn create_n_fewshot_demo_sets(
    student: &Module,
    num_candidate_sets: usize,
    trainset: &[Example],
    cfg: &DemoSetConfig,
    evaluator: &Evaluator,
) -> Result<DemoCandidates> {
    let mut rng = seeded_rng(cfg.seed);
    create_n_fewshot_demo_sets_with_rng(student, num_candidate_sets, trainset, cfg, evaluator, &mut rng).await
}

/// Same as [`create_n_fewshot_demo_sets`] with a caller-owned RNG.
///
/// Set order: zero-shot, labels-only, unshuffled bootstrap, then bootstraps
/// over a shuffled trainset with a size drawn from
/// `[min_num_samples, max_bootstrapped_demos]`. The zero-shot and
/// labels-only slots turn into shuffled bootstraps when
/// `include_non_bootstrapped` is off (labels-only also when
/// `max_labeled_demos` is 0).
#[tracing::instrument(skip_all, fields(num_candidate_sets = num_candidate_sets, trainset = trainset.len()))]
pub async fn create_n_fewshot_demo_sets_with_rng<R: Rng + Send>(
    student: &Module,
    num_candidate_sets: usize,
    trainset: &[Example],
    cfg: &DemoSetConfig,
    evaluator: &Evaluator,
    rng: &mut R,
) -> Result<DemoCandidates> {
    let names = student.predictor_names();
    let mut candidates: DemoCandidates = (0..names.len()).map(|i| (i, Vec::new())).collect();

    for set_idx in 0..num_candidate_sets {
        tracing::info!("creating demo set {}/{}", set_idx + 1, num_candidate_sets);
        let mut trainset_copy = trainset.to_vec();

        let program = match set_idx {
            0 if cfg.include_non_bootstrapped => student.reset_copy(),
            1 if cfg.include_non_bootstrapped && cfg.max_labeled_demos > 0 => {
                LabeledFewShot::new(cfg.max_labeled_demos, evaluator.clone())
                    .with_sample(cfg.labeled_sample)
                    .compile(student, &trainset_copy, cfg.valset.as_deref())
                    .await?
            }
            2 => {
                BootstrapFewShot::new(cfg.bootstrap_config(cfg.max_bootstrapped_demos), evaluator.clone())?
                    .compile_with_teacher(student, cfg.teacher.as_ref(), &trainset_copy)
                    .await?
            }
            _ => {
                trainset_copy.shuffle(rng);
                let size = random_size(cfg.min_num_samples, cfg.max_bootstrapped_demos, rng);
                tracing::debug!(set = set_idx + 1, size, "shuffled bootstrap");
                BootstrapFewShot::new(cfg.bootstrap_config(size), evaluator.clone())?
                    .compile_with_teacher(student, cfg.teacher.as_ref(), &trainset_copy)
                    .await?
            }
        };

        for (i, name) in names.iter().enumerate() {
            let demos = program
                .predictor(name)
                .map(|p| p.demos.clone())
                .unwrap_or_default();
            candidates.entry(i).or_default().push(demos);
        }
    }

    if num_candidate_sets < FIXED_SETS {
        tracing::debug!(num_candidate_sets, "fewer sets requested than fixed kinds; truncated");
    }
    Ok(candidates)
}

/// Uniform size in `[min, max]`; `min` is clamped down to `max`.
fn random_size<R: Rng>(min: usize, max: usize, rng: &mut R) -> usize {
    rng.gen_range(min.min(max)..=max)
}
