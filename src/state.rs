use std::{collections::BTreeMap, fmt};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A scalar flow variable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum StateValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

impl StateValue {
    pub fn as_str(&self) -> Option<&str> {
        if let StateValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            // numbers typed by clients arrive as text
            StateValue::String(s) => s.trim().parse().ok(),
            StateValue::Boolean(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Boolean(b) => Some(*b),
            StateValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            StateValue::Number(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateValue::String(s) => json!(s),
            StateValue::Number(n) => json!(n),
            StateValue::Boolean(b) => json!(b),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::String(s) => f.write_str(s),
            StateValue::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            StateValue::Number(n) => write!(f, "{}", n),
            StateValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::String(s.to_string())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::String(s)
    }
}

impl From<f64> for StateValue {
    fn from(n: f64) -> Self {
        StateValue::Number(n)
    }
}

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Boolean(b)
    }
}

impl TryFrom<Value> for StateValue {
    type Error = ();

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(StateValue::String(s)),
            Value::Number(n) => Ok(StateValue::Number(n.as_f64().ok_or(())?)),
            Value::Bool(b) => Ok(StateValue::Boolean(b)),
            Value::Null | Value::Array(_) | Value::Object(_) => Err(()),
        }
    }
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("placeholder regex")
});

/// Result of rendering a template against a [`VariableContext`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rendered {
    pub text: String,
    /// placeholder names that had no value and rendered as ""
    pub unresolved: Vec<String>,
}

/// Per-conversation variable scope written by `set_value`/`data_input`
/// nodes and external callbacks, read by conditions and interpolation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct VariableContext {
    vars: BTreeMap<String, StateValue>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: StateValue) {
        self.vars.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.vars.remove(name);
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateValue)> {
        self.vars.iter()
    }

    /// Substitute every `{{name}}` placeholder.
    pub fn interpolate(&self, template: &str) -> Rendered {
        let mut unresolved = Vec::new();
        let text = PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures| {
                let name = &caps[1];
                match self.vars.get(name) {
                    Some(v) => v.to_string(),
                    None => {
                        unresolved.push(name.to_string());
                        String::new()
                    }
                }
            })
            .into_owned();
        Rendered { text, unresolved }
    }

    /// Write an external JSON result under `prefix`, see [`flatten_json`].
    pub fn merge_json(&mut self, prefix: &str, value: &Value) -> Vec<(String, StateValue)> {
        let deltas = flatten_json(prefix, value);
        for (k, v) in &deltas {
            self.vars.insert(k.clone(), v.clone());
        }
        deltas
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.vars
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, StateValue)> for VariableContext {
    fn from_iter<T: IntoIterator<Item = (String, StateValue)>>(iter: T) -> Self {
        Self { vars: iter.into_iter().collect() }
    }
}

/// Turn an arbitrary JSON result into scalar variables under `prefix`.
///
/// Scalars land on `prefix` directly. Objects keep their raw JSON text on
/// `prefix` and each scalar field on `prefix.field`. Arrays are stored as
/// raw JSON text only.
pub fn flatten_json(prefix: &str, value: &Value) -> Vec<(String, StateValue)> {
    if let Ok(scalar) = StateValue::try_from(value.clone()) {
        return vec![(prefix.to_string(), scalar)];
    }
    let mut out = vec![(prefix.to_string(), StateValue::String(value.to_string()))];
    if let Value::Object(map) = value {
        for (k, v) in map {
            if let Ok(scalar) = StateValue::try_from(v.clone()) {
                out.push((format!("{}.{}", prefix, k), scalar));
            }
        }
    }
    out
}
