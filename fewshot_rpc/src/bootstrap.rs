use crate::config::BootstrapConfig;
use crate::dataset::{sample, seeded_rng, trace_demo, Demo, Example, DEFAULT_SEED};
use crate::evaluator::Evaluator;
use crate::labeled::LabeledFewShot;
use crate::models::{Lm, Module, NamedMap, RolloutResponse};
use crate::teleprompt::Teleprompter;
use crate::{FewShotError, Result};
use async_trait::async_trait;
use rand::prelude::*;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Outcome of the bootstrap loop.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    /// Demonstrations harvested from successful traces, per predictor.
    pub traces: NamedMap<Vec<Demo>>,
    /// Trainset indices that produced a successful trace.
    pub bootstrapped: BTreeSet<usize>,
    /// Examples never bootstrapped, shuffled with the fixed seed.
    pub validation: Vec<Example>,
    pub attempts: usize,
    pub examples_visited: usize,
}

/// Bootstraps demonstrations by running a teacher program on the service
/// with tracing enabled and keeping the traces of runs that pass the metric.
pub struct BootstrapFewShot {
    cfg: BootstrapConfig,
    evaluator: Evaluator,
    error_count: Mutex<usize>,
}

impl BootstrapFewShot {
    #[tracing::instrument(skip_all)]
    pub fn new(cfg: BootstrapConfig, evaluator: Evaluator) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            evaluator,
            error_count: Mutex::new(0),
        })
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.cfg
    }

    /// Rollout errors seen so far by this optimizer, across compiles.
    pub fn error_count(&self) -> usize {
        *self.error_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compiles with an explicit teacher. Without one the student teaches
    /// itself.
    #[tracing::instrument(skip_all, fields(trainset = trainset.len()))]
    pub async fn compile_with_teacher(
        &self,
        student: &Module,
        teacher: Option<&Module>,
        trainset: &[Example],
    ) -> Result<Module> {
        let (student, teacher) = self.prepare(student, teacher, trainset)?;
        let report = self.bootstrap(&teacher, trainset).await?;
        Ok(self.train(student, &report))
    }

    /// Returns `(student, teacher)`: a reset copy of the student and a
    /// teacher pre-seeded with labeled demos when `max_labeled_demos > 0`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn prepare(
        &self,
        student: &Module,
        teacher: Option<&Module>,
        trainset: &[Example],
    ) -> Result<(Module, Module)> {
        let student_copy = student.reset_copy();
        let mut teacher_copy = teacher.unwrap_or(student).clone();

        if self.cfg.max_labeled_demos > 0 {
            let labeled = LabeledFewShot::new(self.cfg.max_labeled_demos, self.evaluator.clone());
            teacher_copy = labeled.label(&teacher_copy, trainset, true);
        }

        student_copy.ensure_compatible(&teacher_copy)?;
        Ok((student_copy, teacher_copy))
    }

    /// Runs the teacher over `trainset` in order until
    /// `max_bootstrapped_demos` examples have succeeded.
    #[tracing::instrument(skip_all, fields(trainset = trainset.len()))]
    pub async fn bootstrap(&self, teacher: &Module, trainset: &[Example]) -> Result<BootstrapReport> {
        let mut report = BootstrapReport {
            traces: teacher
                .predictor_names()
                .into_iter()
                .map(|name| (name, Vec::new()))
                .collect(),
            ..Default::default()
        };

        for (idx, example) in trainset.iter().enumerate() {
            if report.bootstrapped.len() >= self.cfg.max_bootstrapped_demos {
                break;
            }
            report.examples_visited = idx + 1;

            for round in 0..self.cfg.max_rounds {
                report.attempts += 1;
                if self
                    .bootstrap_one_example(teacher, example, round, &mut report.traces)
                    .await?
                {
                    report.bootstrapped.insert(idx);
                    break;
                }
            }
        }

        report.validation = trainset
            .iter()
            .enumerate()
            .filter(|(idx, _)| !report.bootstrapped.contains(idx))
            .map(|(_, x)| x.clone())
            .collect();
        report.validation.shuffle(&mut seeded_rng(DEFAULT_SEED));

        tracing::info!(
            bootstrapped = report.bootstrapped.len(),
            examples = report.examples_visited,
            max_rounds = self.cfg.max_rounds,
            attempts = report.attempts,
            "bootstrapped {} full traces after {} examples for up to {} rounds, amounting to {} attempts",
            report.bootstrapped.len(),
            report.examples_visited,
            self.cfg.max_rounds,
            report.attempts,
        );
        Ok(report)
    }

    /// One attempt. `Ok(false)` is a soft failure; `Err` only once the error
    /// budget is spent.
    async fn bootstrap_one_example(
        &self,
        teacher: &Module,
        example: &Example,
        round: usize,
        traces: &mut NamedMap<Vec<Demo>>,
    ) -> Result<bool> {
        match self.attempt(teacher, example, round, traces).await {
            Ok(success) => Ok(success),
            Err(err) => {
                tracing::error!(round, "error bootstrapping example: {err}");
                let current = {
                    let mut count = self.error_count.lock().unwrap_or_else(|e| e.into_inner());
                    *count += 1;
                    *count
                };
                match self.cfg.max_errors {
                    Some(max) if current >= max => Err(err),
                    _ => Ok(false),
                }
            }
        }
    }

    async fn attempt(
        &self,
        teacher: &Module,
        example: &Example,
        round: usize,
        traces: &mut NamedMap<Vec<Demo>>,
    ) -> Result<bool> {
        // The example must not appear among its own demonstrations.
        let mut candidate = teacher.clone();
        for predictor in candidate.predictors_mut() {
            predictor.demos.retain(|demo| demo != example);
        }

        let lm = self.round_lm(round);
        let response = self
            .evaluator
            .evaluate(
                std::slice::from_ref(&candidate),
                std::slice::from_ref(example),
                true,
                lm.as_ref(),
            )
            .await?;

        let Some(name2demos) = self.accepted_demos(&response) else {
            return Ok(false);
        };

        // Checked up front so a bad trace leaves no partial demos behind.
        if let Some(unknown) = name2demos.keys().find(|name| traces.get(name).is_none()) {
            return Err(FewShotError::Schema(format!(
                "trace names unknown predictor {unknown}"
            )));
        }
        for (name, demos) in name2demos.iter() {
            if let Some(collected) = traces.get_mut(name) {
                if demos.len() > 1 {
                    collected.push(pick_one(demos)?);
                } else {
                    collected.extend(demos.iter().cloned());
                }
            }
        }
        Ok(true)
    }

    /// Round 0 uses `teacher_lm` as configured; later rounds get a fresh
    /// rollout id at temperature 1.0.
    fn round_lm(&self, round: usize) -> Option<Lm> {
        match &self.cfg.teacher_lm {
            Some(lm) if round > 0 => Some(lm.for_retry_round(round)),
            Some(lm) => Some(lm.clone()),
            None => None,
        }
    }

    /// Demos grouped by predictor when the rollout passed, `None` otherwise.
    fn accepted_demos(&self, response: &RolloutResponse) -> Option<NamedMap<Vec<Demo>>> {
        if response.results.len() != 1 {
            tracing::warn!("expected 1 result, got {}", response.results.len());
            return None;
        }
        let result = &response.results[0];

        let Some(score) = result.score else {
            tracing::warn!("no score returned from server");
            return None;
        };
        if !self.cfg.accepts(score) {
            tracing::debug!(score, "example failed metric");
            return None;
        }

        let trace = match result.trace.as_deref() {
            Some(steps) if !steps.is_empty() => steps,
            _ => {
                tracing::warn!("no trace returned despite trace=true");
                return None;
            }
        };

        let mut name2demos: NamedMap<Vec<Demo>> = NamedMap::new();
        for step in trace {
            if !step.prediction.has_output() {
                continue;
            }
            let Some(output) = step.prediction.output.clone() else {
                continue;
            };
            let demo = trace_demo(step.inputs.clone(), output);
            match name2demos.get_mut(&step.predictor_name) {
                Some(demos) => demos.push(demo),
                None => name2demos.insert(step.predictor_name.clone(), vec![demo]),
            }
        }
        Some(name2demos)
    }

    /// Assigns each predictor its bootstrapped demos followed by labeled
    /// demos drawn from the validation pool.
    ///
    /// Each draw replaces the pool, so predictors later in order choose from
    /// what earlier predictors kept. This ordering is intentional and kept
    /// for parity with existing compiled programs.
    #[tracing::instrument(skip_all)]
    pub fn train(&self, mut student: Module, report: &BootstrapReport) -> Module {
        let mut rng = seeded_rng(DEFAULT_SEED);
        let mut raw_demos = report.validation.clone();

        for (name, predictor) in student.named_predictors.iter_mut() {
            let augmented: Vec<Demo> = report
                .traces
                .get(name)
                .map(|t| t.iter().take(self.cfg.max_bootstrapped_demos).cloned().collect())
                .unwrap_or_default();

            let sample_size = self
                .cfg
                .max_labeled_demos
                .saturating_sub(augmented.len())
                .min(raw_demos.len());
            raw_demos = sample(&raw_demos, sample_size, &mut rng);

            tracing::info!(
                predictor = name,
                bootstrapped = augmented.len(),
                labeled = raw_demos.len(),
                "predictor demos assigned"
            );
            predictor.demos = augmented.into_iter().chain(raw_demos.iter().cloned()).collect();
        }
        student
    }
}

/// Picks one of several same-predictor demos from a single rollout: half the
/// time uniformly among the earlier ones, otherwise the last. Seeded from a
/// content hash so identical inputs always pick the same demo.
fn pick_one(demos: &[Demo]) -> Result<Demo> {
    let mut rng = StdRng::seed_from_u64(content_seed(demos)?);
    let (last, earlier) = match demos.split_last() {
        Some(split) => split,
        None => return Ok(Demo::new()),
    };
    let picked = if rng.gen::<f64>() < 0.5 {
        earlier.choose(&mut rng).unwrap_or(last)
    } else {
        last
    };
    Ok(picked.clone())
}

/// Map keys serialize sorted, so the digest ignores key insertion order.
fn content_seed(demos: &[Demo]) -> Result<u64> {
    let text = serde_json::to_string(demos)?;
    let digest = Sha256::digest(text.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(seed))
}

#[async_trait]
impl Teleprompter for BootstrapFewShot {
    #[tracing::instrument(skip_all)]
    async fn compile(
        &self,
        student: &Module,
        trainset: &[Example],
        _valset: Option<&[Example]>,
    ) -> Result<Module> {
        self.compile_with_teacher(student, None, trainset).await
    }

    fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    fn name(&self) -> &'static str {
        "bootstrap_few_shot"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::testing::*;
    use crate::models::{Field, FieldKind, Predictor, Signature};
    use serde_json::json;

    fn signature(instructions: &str) -> Signature {
        Signature::new(instructions)
            .with_input("question", Field::input("Q:", FieldKind::String))
            .with_output("answer", Field::output("A:", FieldKind::String))
    }

    fn student() -> Module {
        Module::new([
            ("draft", Predictor::new(signature("Draft."))),
            ("answer", Predictor::new(signature("Answer."))),
        ])
    }

    fn trainset(n: usize) -> Vec<Example> {
        (0..n).map(example).collect()
    }

    fn index_of(call: &Call) -> usize {
        call.examples[0]["question"].as_str().unwrap()[1..].parse().unwrap()
    }

    fn optimizer(cfg: BootstrapConfig, harness: std::sync::Arc<ScriptedHarness>) -> BootstrapFewShot {
        BootstrapFewShot::new(cfg, evaluator_with(harness)).unwrap()
    }

    fn full_trace(ex: &Example) -> Option<Vec<crate::models::TraceStep>> {
        Some(vec![
            step("draft", ex, json!({"answer": "draft"})),
            step("answer", ex, json!({"answer": "final"})),
        ])
    }

    async fn bootstrapped_with_score(threshold: Option<f64>, score: f64) -> usize {
        let harness = ScriptedHarness::new(move |call| {
            let ex = &call.examples[0];
            Ok(scored(ex, Some(score), full_trace(ex)))
        });
        let cfg = BootstrapConfig {
            metric_threshold: threshold,
            max_labeled_demos: 0,
            ..Default::default()
        };
        let opt = optimizer(cfg, harness);
        let teacher = student();
        opt.bootstrap(&teacher, &trainset(1)).await.unwrap().bootstrapped.len()
    }

    #[tokio::test]
    async fn positive_score_required_without_threshold() {
        assert_eq!(bootstrapped_with_score(None, 0.0).await, 0);
        assert_eq!(bootstrapped_with_score(None, 0.0001).await, 1);
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        assert_eq!(bootstrapped_with_score(Some(0.5), 0.5).await, 1);
        assert_eq!(bootstrapped_with_score(Some(0.5), 0.49).await, 0);
    }

    #[tokio::test]
    async fn end_to_end_stops_at_target_and_pools_the_rest() {
        let harness = ScriptedHarness::new(|call| {
            let ex = &call.examples[0];
            if index_of(call) < 2 {
                Ok(scored(ex, Some(1.0), Some(vec![step("answer", ex, json!({"answer": "ok"}))])))
            } else {
                Ok(scored(ex, Some(0.0), None))
            }
        });
        let cfg = BootstrapConfig {
            max_bootstrapped_demos: 2,
            max_rounds: 1,
            ..Default::default()
        };
        let opt = optimizer(cfg, harness.clone());
        let data = trainset(5);
        let (_, teacher) = opt.prepare(&student(), None, &data).unwrap();

        let report = opt.bootstrap(&teacher, &data).await.unwrap();

        assert_eq!(report.bootstrapped, BTreeSet::from([0, 1]));
        assert_eq!(harness.calls().len(), 2);
        let mut expected = data[2..].to_vec();
        expected.shuffle(&mut seeded_rng(0));
        assert_eq!(report.validation, expected);
        assert_eq!(report.traces.get("answer").unwrap().len(), 2);
        assert!(report.traces.get("draft").unwrap().is_empty());
    }

    #[tokio::test]
    async fn compiled_demo_counts_stay_within_limits() {
        let harness = ScriptedHarness::new(|call| {
            let ex = &call.examples[0];
            Ok(scored(ex, Some(1.0), full_trace(ex)))
        });
        let cfg = BootstrapConfig {
            max_bootstrapped_demos: 2,
            max_labeled_demos: 3,
            ..Default::default()
        };
        let opt = optimizer(cfg, harness);
        let original = student();
        let compiled = opt.compile(&original, &trainset(8), None).await.unwrap();

        for p in compiled.predictors() {
            assert!(p.demos.len() <= 2 + 3);
            assert_eq!(p.demos.iter().filter(|d| d.contains_key("outputs")).count(), 2);
        }
        assert_eq!(original, student());
    }

    #[tokio::test]
    async fn current_example_is_removed_from_teacher_demos() {
        let harness = ScriptedHarness::new(|call| Ok(scored(&call.examples[0], Some(0.0), None)));
        let cfg = BootstrapConfig {
            max_labeled_demos: 16,
            ..Default::default()
        };
        let opt = optimizer(cfg, harness.clone());
        opt.compile(&student(), &trainset(4), None).await.unwrap();

        let calls = harness.calls();
        assert_eq!(calls.len(), 4);
        for call in calls {
            let current = &call.examples[0];
            for p in call.candidates[0].predictors() {
                assert_eq!(p.demos.len(), 3);
                assert!(!p.demos.contains(current));
            }
        }
    }

    #[tokio::test]
    async fn retry_rounds_vary_the_teacher_lm() {
        let harness = ScriptedHarness::new(|call| Ok(scored(&call.examples[0], Some(0.0), None)));
        let teacher_lm = Lm::new("teacher-model");
        let cfg = BootstrapConfig {
            max_rounds: 3,
            teacher_lm: Some(teacher_lm.clone()),
            ..Default::default()
        };
        let opt = optimizer(cfg, harness.clone());
        opt.compile(&student(), &trainset(1), None).await.unwrap();

        let lms: Vec<Option<Lm>> = harness.calls().into_iter().map(|c| c.lm).collect();
        assert_eq!(lms.len(), 3);
        assert_eq!(lms[0], Some(teacher_lm.clone()));
        assert_eq!(lms[1], Some(teacher_lm.for_retry_round(1)));
        assert_eq!(lms[2].as_ref().and_then(|l| l.rollout_id), Some(2));
        assert_eq!(lms[2].as_ref().and_then(|l| l.temperature), Some(1.0));
    }

    #[tokio::test]
    async fn retry_rounds_without_teacher_lm_send_no_override() {
        let harness = ScriptedHarness::new(|call| Ok(scored(&call.examples[0], Some(0.0), None)));
        let cfg = BootstrapConfig {
            max_rounds: 2,
            ..Default::default()
        };
        let opt = optimizer(cfg, harness.clone());
        opt.compile(&student(), &trainset(1), None).await.unwrap();
        assert!(harness.calls().iter().all(|c| c.lm.is_none() && c.trace));
    }

    #[tokio::test]
    async fn error_budget_aborts_on_the_third_failure() {
        let harness = ScriptedHarness::new(|_| Err(transport_failure()));
        let cfg = BootstrapConfig {
            max_errors: Some(3),
            ..Default::default()
        };
        let opt = optimizer(cfg, harness.clone());
        let err = opt.compile(&student(), &trainset(5), None).await.unwrap_err();

        assert!(matches!(err, FewShotError::Transport { status: Some(503), .. }));
        assert_eq!(harness.calls().len(), 3);
        assert_eq!(opt.error_count(), 3);
    }

    #[tokio::test]
    async fn unlimited_errors_are_soft_failures() {
        let harness = ScriptedHarness::new(|_| Err(transport_failure()));
        let opt = optimizer(BootstrapConfig::default(), harness.clone());
        let compiled = opt.compile(&student(), &trainset(5), None).await.unwrap();

        assert_eq!(harness.calls().len(), 5);
        assert_eq!(opt.error_count(), 5);
        assert!(compiled
            .predictors()
            .all(|p| p.demos.iter().all(|d| !d.contains_key("outputs"))));
    }

    #[tokio::test]
    async fn incompatible_teacher_is_fatal_before_any_rollout() {
        let harness = ScriptedHarness::new(|call| Ok(scored(&call.examples[0], Some(1.0), None)));
        let opt = optimizer(BootstrapConfig::default(), harness.clone());
        let teacher = Module::new([("answer", Predictor::new(signature("Answer.")))]);

        let err = opt
            .compile_with_teacher(&student(), Some(&teacher), &trainset(3))
            .await
            .unwrap_err();
        assert!(matches!(err, FewShotError::IncompatiblePrograms(_)));
        assert!(harness.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_trace_or_extra_results_are_soft_failures() {
        let harness = ScriptedHarness::new(|call| {
            let ex = &call.examples[0];
            if index_of(call) == 0 {
                Ok(scored(ex, Some(1.0), Some(vec![])))
            } else {
                let mut resp = scored(ex, Some(1.0), full_trace(ex));
                resp.results.push(resp.results[0].clone());
                Ok(resp)
            }
        });
        let opt = optimizer(BootstrapConfig::default(), harness);
        let report = opt.bootstrap(&student(), &trainset(2)).await.unwrap();
        assert!(report.bootstrapped.is_empty());
        assert_eq!(report.validation.len(), 2);
    }

    #[tokio::test]
    async fn unknown_predictor_in_trace_counts_as_an_error() {
        let harness = ScriptedHarness::new(|call| {
            let ex = &call.examples[0];
            Ok(scored(
                ex,
                Some(1.0),
                Some(vec![
                    step("answer", ex, json!({"answer": "ok"})),
                    step("ghost", ex, json!({"answer": "boo"})),
                ]),
            ))
        });
        let cfg = BootstrapConfig {
            max_labeled_demos: 0,
            ..Default::default()
        };
        let opt = optimizer(cfg, harness.clone());
        let report = opt.bootstrap(&student(), &trainset(2)).await.unwrap();

        assert!(report.bootstrapped.is_empty());
        assert_eq!(report.validation.len(), 2);
        assert!(report.traces.get("answer").unwrap().is_empty());
        assert_eq!(opt.error_count(), 2);

        let strict = optimizer(
            BootstrapConfig {
                max_labeled_demos: 0,
                max_errors: Some(1),
                ..Default::default()
            },
            harness.clone(),
        );
        let err = strict.compile(&student(), &trainset(2), None).await.unwrap_err();
        assert!(matches!(err, FewShotError::Schema(msg) if msg.contains("ghost")));
        assert_eq!(strict.error_count(), 1);
        assert_eq!(harness.calls().len(), 3);
    }

    #[tokio::test]
    async fn harness_failures_spend_the_error_budget() {
        let harness = ScriptedHarness::new(|_| Err(FewShotError::Harness("metric crashed".to_string())));
        let cfg = BootstrapConfig {
            max_errors: Some(2),
            ..Default::default()
        };
        let opt = optimizer(cfg, harness.clone());
        let err = opt.compile(&student(), &trainset(4), None).await.unwrap_err();

        assert!(matches!(err, FewShotError::Harness(_)));
        assert_eq!(harness.calls().len(), 2);
    }

    #[tokio::test]
    async fn repeated_predictor_steps_pick_one_deterministically() {
        let harness = ScriptedHarness::new(|call| {
            let ex = &call.examples[0];
            Ok(scored(
                ex,
                Some(1.0),
                Some(vec![
                    step("answer", ex, json!({"answer": "first"})),
                    step("answer", ex, json!({})),
                    step("answer", ex, json!({"answer": "second"})),
                    step("answer", ex, json!({"answer": "third"})),
                ]),
            ))
        });
        let opt = optimizer(BootstrapConfig::default(), harness);
        let a = opt.bootstrap(&student(), &trainset(1)).await.unwrap();
        let b = opt.bootstrap(&student(), &trainset(1)).await.unwrap();

        let picked = a.traces.get("answer").unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked, b.traces.get("answer").unwrap());
        let answer = picked[0]["outputs"]["answer"].as_str().unwrap();
        assert!(["first", "second", "third"].contains(&answer));
    }

    #[test]
    fn content_seed_ignores_key_insertion_order() {
        let mut a = Demo::new();
        a.insert("inputs".to_string(), json!({"q": 1}));
        a.insert("outputs".to_string(), json!("x"));
        let mut b = Demo::new();
        b.insert("outputs".to_string(), json!("x"));
        b.insert("inputs".to_string(), json!({"q": 1}));
        assert_eq!(content_seed(&[a.clone()]).unwrap(), content_seed(&[b]).unwrap());
        assert_ne!(content_seed(&[a.clone()]).unwrap(), content_seed(&[a.clone(), a]).unwrap());
    }

    // Each predictor's labeled draw replaces the shared pool, so a later
    // predictor can only pick from what the earlier one kept.
    #[test]
    fn labeled_pool_shrinks_across_predictors() {
        let harness = ScriptedHarness::new(|_| Ok(RolloutResponse::default()));
        let cfg = BootstrapConfig {
            max_bootstrapped_demos: 4,
            max_labeled_demos: 3,
            ..Default::default()
        };
        let opt = optimizer(cfg, harness);
        let data = trainset(6);
        let mut traces: NamedMap<Vec<Demo>> = NamedMap::new();
        traces.insert("draft", vec![trace_demo(serde_json::Map::new(), json!("d1")), trace_demo(serde_json::Map::new(), json!("d2"))]);
        traces.insert("answer", vec![]);
        let report = BootstrapReport {
            traces,
            validation: data.clone(),
            ..Default::default()
        };

        let trained = opt.train(student().reset_copy(), &report);
        let draft = &trained.predictor("draft").unwrap().demos;
        let answer = &trained.predictor("answer").unwrap().demos;

        assert_eq!(draft.len(), 3);
        assert_eq!(&draft[..2], &report.traces.get("draft").unwrap()[..]);
        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0], draft[2]);
    }
}
