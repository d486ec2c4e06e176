use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::state::StateValue;

/// Accepted shape of a `data_input` answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Text,
    Email,
    Phone,
    Number,
    /// the whole answer must match this pattern
    Regex(String),
}

/// A client answer that did not fit; the node re-prompts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationMismatch {
    #[error("please type an answer")]
    Empty,
    #[error("please enter a valid e-mail address")]
    Email,
    #[error("please enter a valid phone number")]
    Phone,
    #[error("please enter a number")]
    Number,
    #[error("must match /{0}/")]
    Pattern(String),
    #[error("internal pattern error: {0}")]
    BadPattern(String),
    #[error("please send a link to the file")]
    Attachment,
}

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 ()\-]{5,18}[0-9]$").expect("phone regex"));

pub fn parse_and_validate(
    raw: &str,
    format: Option<&InputFormat>,
) -> Result<StateValue, ValidationMismatch> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationMismatch::Empty);
    }
    match format {
        None | Some(InputFormat::Text) => Ok(StateValue::String(trimmed.to_string())),
        Some(InputFormat::Email) => {
            if EMAIL.is_match(trimmed) {
                Ok(StateValue::String(trimmed.to_string()))
            } else {
                Err(ValidationMismatch::Email)
            }
        }
        Some(InputFormat::Phone) => {
            let digits = trimmed.chars().filter(|c| c.is_ascii_digit()).count();
            if PHONE.is_match(trimmed) && digits >= 7 {
                Ok(StateValue::String(trimmed.to_string()))
            } else {
                Err(ValidationMismatch::Phone)
            }
        }
        Some(InputFormat::Number) => trimmed
            .replace(',', ".")
            .parse::<f64>()
            .map(StateValue::Number)
            .map_err(|_| ValidationMismatch::Number),
        Some(InputFormat::Regex(pattern)) => {
            let anchored = format!("^(?:{})$", pattern);
            let re = Regex::new(&anchored)
                .map_err(|e| ValidationMismatch::BadPattern(e.to_string()))?;
            if re.is_match(trimmed) {
                Ok(StateValue::String(trimmed.to_string()))
            } else {
                Err(ValidationMismatch::Pattern(pattern.clone()))
            }
        }
    }
}

/// An attachment arrives as an absolute http(s) link to the uploaded file.
pub fn parse_attachment(raw: &str) -> Result<Url, ValidationMismatch> {
    let url = Url::parse(raw.trim()).map_err(|_| ValidationMismatch::Attachment)?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        _ => Err(ValidationMismatch::Attachment),
    }
}

/// Resolve a menu answer typed as text: a 1-based option number or a label,
/// compared case-insensitively.
pub fn match_menu_option<'a>(labels: impl IntoIterator<Item = &'a str>, raw: &str) -> Option<usize> {
    let norm = raw.trim().to_lowercase();
    let labels: Vec<&str> = labels.into_iter().collect();
    if let Ok(n) = norm.parse::<usize>() {
        if n >= 1 && n <= labels.len() {
            return Some(n - 1);
        }
    }
    labels.iter().position(|l| l.trim().to_lowercase() == norm)
}
