use crate::dataset::{Demo, Example};
use crate::{FewShotError, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

/// String-keyed map that keeps insertion order on the wire.
///
/// Equality ignores order, like comparing two JSON objects. Code that needs
/// positional agreement (program compatibility) compares `keys()` directly.
#[derive(Debug, Clone)]
pub struct NamedMap<V>(Vec<(String, V)>);

impl<V> Default for NamedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> NamedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces. A replaced entry keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: V) {
        let name = name.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        self.0.iter_mut().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.0.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.0.iter_mut().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut V)> {
        self.0.iter_mut().map(|(k, v)| (k.as_str(), v))
    }
}

impl<V, K: Into<String>> FromIterator<(K, V)> for NamedMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = NamedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<V: PartialEq> PartialEq for NamedMap<V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<V: Serialize> Serialize for NamedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for NamedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NamedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for NamedMapVisitor<V> {
            type Value = NamedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map keyed by name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut out = NamedMap::new();
                while let Some((k, v)) = access.next_entry::<String, V>()? {
                    out.insert(k, v);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(NamedMapVisitor(PhantomData))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// Semantic type tag of a signature field: a named kind or a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldType {
    Kind(FieldKind),
    Schema(serde_json::Map<String, Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldRole {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub prefix: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub kind: FieldRole,
    #[serde(default)]
    pub description: Option<String>,
}

impl Field {
    pub fn input(prefix: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            prefix: prefix.into(),
            field_type: FieldType::Kind(kind),
            kind: FieldRole::Input,
            description: None,
        }
    }

    pub fn output(prefix: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            prefix: prefix.into(),
            field_type: FieldType::Kind(kind),
            kind: FieldRole::Output,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub instructions: String,
    pub input_fields: NamedMap<Field>,
    pub output_fields: NamedMap<Field>,
}

impl Signature {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            input_fields: NamedMap::new(),
            output_fields: NamedMap::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, field: Field) -> Self {
        self.input_fields.insert(name, field);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, field: Field) -> Self {
        self.output_fields.insert(name, field);
        self
    }

    pub fn with_instructions(&self, instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Chat,
    Text,
    Responses,
}

/// Language-model override sent along with a rollout or attached to a predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lm {
    pub model: String,
    #[serde(default)]
    pub model_type: ModelType,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub rollout_id: Option<u64>,
}

impl Lm {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            model_type: ModelType::default(),
            temperature: None,
            rollout_id: None,
        }
    }

    /// Variant used for retry rounds: a fresh rollout id defeats server-side
    /// response caching and temperature 1.0 diversifies the attempt.
    pub fn for_retry_round(&self, round: usize) -> Self {
        Self {
            rollout_id: Some(round as u64),
            temperature: Some(1.0),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictor {
    pub signature: Signature,
    #[serde(default)]
    pub demos: Vec<Demo>,
    #[serde(default)]
    pub lm: Option<Lm>,
}

impl Predictor {
    pub fn new(signature: Signature) -> Self {
        Self {
            signature,
            demos: vec![],
            lm: None,
        }
    }

    pub fn reset(&mut self) {
        self.lm = None;
        self.demos.clear();
    }
}

/// A program: named predictors executed together, in order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Module {
    pub named_predictors: NamedMap<Predictor>,
}

impl Module {
    pub fn new<K: Into<String>>(predictors: impl IntoIterator<Item = (K, Predictor)>) -> Self {
        Self {
            named_predictors: predictors.into_iter().collect(),
        }
    }

    pub fn predictor_names(&self) -> Vec<String> {
        self.named_predictors.keys().map(str::to_string).collect()
    }

    pub fn predictors(&self) -> impl Iterator<Item = &Predictor> {
        self.named_predictors.values()
    }

    pub fn predictors_mut(&mut self) -> impl Iterator<Item = &mut Predictor> {
        self.named_predictors.values_mut()
    }

    pub fn predictor(&self, name: &str) -> Option<&Predictor> {
        self.named_predictors.get(name)
    }

    /// Deep copy with every predictor's demos and LM override cleared.
    pub fn reset_copy(&self) -> Self {
        let mut copy = self.clone();
        for predictor in copy.predictors_mut() {
            predictor.reset();
        }
        copy
    }

    /// Same predictor names in the same order, each with an equal signature.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn ensure_compatible(&self, other: &Module) -> Result<()> {
        if self.named_predictors.len() != other.named_predictors.len() {
            return Err(FewShotError::IncompatiblePrograms(format!(
                "predictor count differs: {} vs {}",
                self.named_predictors.len(),
                other.named_predictors.len()
            )));
        }
        for ((name1, p1), (name2, p2)) in self.named_predictors.iter().zip(other.named_predictors.iter()) {
            if name1 != name2 {
                return Err(FewShotError::IncompatiblePrograms(format!(
                    "predictor name mismatch: {name1} vs {name2}"
                )));
            }
            if p1.signature != p2.signature {
                return Err(FewShotError::IncompatiblePrograms(format!(
                    "signature mismatch for predictor {name1}"
                )));
            }
        }
        Ok(())
    }
}

/// Output of one predictor call, or the error it raised.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(rename = "errorType", alias = "error_type", default)]
    pub error_type: Option<String>,
    #[serde(rename = "errorMessage", alias = "error_message", default)]
    pub error_message: Option<String>,
    #[serde(rename = "errorTraceback", alias = "error_traceback", default)]
    pub error_traceback: Option<String>,
}

impl Prediction {
    pub fn ok(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            output: None,
            error_type: Some(error_type.into()),
            error_message: Some(message.into()),
            error_traceback: None,
        }
    }

    /// Whether the output is usable as a demonstration. Null, false, zero and
    /// empty strings/arrays/objects count as empty.
    pub fn has_output(&self) -> bool {
        match &self.output {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRequest {
    // Field name is part of the service contract.
    #[serde(rename = "canidates")]
    pub candidates: Vec<Module>,
    pub examples: Vec<Example>,
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub lm: Option<Lm>,
}

/// One predictor invocation inside a traced program run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub predictor_name: String,
    pub inputs: serde_json::Map<String, Value>,
    pub prediction: Prediction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(rhs.total_tokens),
        }
    }
}

/// Result of running one candidate on one example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutResult {
    pub example: Example,
    pub prediction: Prediction,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub trace: Option<Vec<TraceStep>>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RolloutResponse {
    pub results: Vec<RolloutResult>,
}

impl RolloutResponse {
    /// Token usage summed over the results that reported it.
    pub fn total_usage(&self) -> Option<Usage> {
        self.results
            .iter()
            .filter_map(|r| r.usage)
            .reduce(|acc, u| acc + u)
    }
}
