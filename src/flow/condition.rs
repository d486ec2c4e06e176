use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{StateValue, VariableContext};

/// A test against the conversation variables, written in flow files as a
/// single-key map such as `{"greater_than": {"variable": "age", "value": 17}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Equals { variable: String, value: StateValue },
    NotEquals { variable: String, value: StateValue },
    /// case-insensitive substring test
    Contains { variable: String, value: String },
    GreaterThan { variable: String, value: f64 },
    LessThan { variable: String, value: f64 },
    Exists { variable: String },
    Matches { variable: String, pattern: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredicateError {
    #[error("variable `{0}` is not set")]
    Unset(String),
    #[error("variable `{variable}` is not numeric: `{value}`")]
    NotNumeric { variable: String, value: String },
    #[error("invalid pattern `{pattern}`: {reason}")]
    BadPattern { pattern: String, reason: String },
}

/// One arm of a condition node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Branch {
    pub when: Predicate,
    pub target: String,
}

impl Predicate {
    pub fn variable(&self) -> &str {
        match self {
            Predicate::Equals { variable, .. }
            | Predicate::NotEquals { variable, .. }
            | Predicate::Contains { variable, .. }
            | Predicate::GreaterThan { variable, .. }
            | Predicate::LessThan { variable, .. }
            | Predicate::Exists { variable }
            | Predicate::Matches { variable, .. } => variable,
        }
    }

    /// Evaluate against `vars`. Errors are reported, callers treat them as
    /// a non-match.
    pub fn evaluate(&self, vars: &VariableContext) -> Result<bool, PredicateError> {
        let name = self.variable();
        if let Predicate::Exists { .. } = self {
            return Ok(vars.contains(name));
        }
        let current = vars
            .get(name)
            .ok_or_else(|| PredicateError::Unset(name.to_string()))?;

        match self {
            Predicate::Equals { value, .. } => Ok(loosely_equal(current, value)),
            Predicate::NotEquals { value, .. } => Ok(!loosely_equal(current, value)),
            Predicate::Contains { value, .. } => Ok(current
                .to_string()
                .to_lowercase()
                .contains(&value.to_lowercase())),
            Predicate::GreaterThan { value, .. } => Ok(numeric(name, current)? > *value),
            Predicate::LessThan { value, .. } => Ok(numeric(name, current)? < *value),
            Predicate::Matches { pattern, .. } => {
                let re = Regex::new(pattern).map_err(|e| PredicateError::BadPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                Ok(re.is_match(&current.to_string()))
            }
            Predicate::Exists { .. } => Ok(true),
        }
    }
}

fn numeric(name: &str, value: &StateValue) -> Result<f64, PredicateError> {
    value.as_number().ok_or_else(|| PredicateError::NotNumeric {
        variable: name.to_string(),
        value: value.to_string(),
    })
}

// "42" equals 42 and "Yes" equals true, otherwise compare trimmed text
fn loosely_equal(current: &StateValue, expected: &StateValue) -> bool {
    match expected {
        StateValue::Number(n) => current.as_number() == Some(*n),
        StateValue::Boolean(b) => current.as_bool() == Some(*b),
        StateValue::String(s) => current.to_string().trim() == s.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> VariableContext {
        let mut v = VariableContext::new();
        v.set("age", StateValue::from("42"));
        v.set("name", StateValue::from("Maria Silva"));
        v.set("vip", StateValue::Boolean(true));
        v
    }

    #[test]
    fn condition_matches_basic() {
        let v = vars();
        let eq = Predicate::Equals { variable: "age".into(), value: StateValue::Number(42.0) };
        assert_eq!(eq.evaluate(&v), Ok(true));

        let ne = Predicate::NotEquals { variable: "vip".into(), value: StateValue::Boolean(true) };
        assert_eq!(ne.evaluate(&v), Ok(false));

        let gt = Predicate::GreaterThan { variable: "age".into(), value: 18.0 };
        assert_eq!(gt.evaluate(&v), Ok(true));
        let lt = Predicate::LessThan { variable: "age".into(), value: 18.0 };
        assert_eq!(lt.evaluate(&v), Ok(false));

        let contains = Predicate::Contains { variable: "name".into(), value: "silva".into() };
        assert_eq!(contains.evaluate(&v), Ok(true));

        let matches = Predicate::Matches { variable: "name".into(), pattern: "^Maria".into() };
        assert_eq!(matches.evaluate(&v), Ok(true));
    }

    #[test]
    fn exists_never_errors() {
        let v = vars();
        assert_eq!(Predicate::Exists { variable: "age".into() }.evaluate(&v), Ok(true));
        assert_eq!(Predicate::Exists { variable: "zip".into() }.evaluate(&v), Ok(false));
    }

    #[test]
    fn evaluation_errors_are_reported() {
        let v = vars();
        let unset = Predicate::Equals { variable: "zip".into(), value: "1000".into() };
        assert!(matches!(unset.evaluate(&v), Err(PredicateError::Unset(_))));

        let not_numeric = Predicate::GreaterThan { variable: "name".into(), value: 1.0 };
        assert!(matches!(not_numeric.evaluate(&v), Err(PredicateError::NotNumeric { .. })));

        let bad = Predicate::Matches { variable: "name".into(), pattern: "(".into() };
        assert!(matches!(bad.evaluate(&v), Err(PredicateError::BadPattern { .. })));
    }

    #[test]
    fn branch_uses_single_key_map_format() {
        let branch: Branch = serde_json::from_value(json!({
            "when": {"greater_than": {"variable": "age", "value": 17}},
            "target": "adult"
        }))
        .unwrap();
        assert_eq!(branch.target, "adult");
        assert_eq!(
            branch.when,
            Predicate::GreaterThan { variable: "age".into(), value: 17.0 }
        );
    }
}
