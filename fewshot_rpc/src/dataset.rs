use rand::prelude::*;
use rand::rngs::StdRng;
use serde_json::Value;

/// A raw training example: field name to value.
pub type Example = serde_json::Map<String, Value>;

/// A demonstration attached to a predictor. Labeled demos are raw examples;
/// bootstrapped demos are `{"inputs": {...}, "outputs": ...}` objects.
pub type Demo = serde_json::Map<String, Value>;

/// Fixed seed for every deterministic draw the optimizers make.
pub const DEFAULT_SEED: u64 = 0;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Demonstration built from one traced predictor call.
pub fn trace_demo(inputs: serde_json::Map<String, Value>, outputs: Value) -> Demo {
    let mut demo = Demo::new();
    demo.insert("inputs".to_string(), Value::Object(inputs));
    demo.insert("outputs".to_string(), outputs);
    demo
}

/// Uniform sample of `n` items without replacement, in draw order.
/// `n` is clamped to `items.len()`.
pub fn sample<T: Clone, R: Rng + ?Sized>(items: &[T], n: usize, rng: &mut R) -> Vec<T> {
    let n = n.min(items.len());
    rand::seq::index::sample(rng, items.len(), n)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}
