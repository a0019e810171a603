// src/invoice.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON object found in model reply")]
    NoObject,
    #[error("model reply is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of one GST validation rule as reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Pass,
    Warning,
    Fail,
    NotApplicable,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleOutcome {
    #[serde(default)]
    pub rule_name: String,
    pub status: RuleStatus,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocScore {
    Acceptable,
    Warning,
    Critical,
}

impl DocScore {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocScore::Acceptable => "ACCEPTABLE",
            DocScore::Warning => "WARNING",
            DocScore::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCEPTABLE" => Some(DocScore::Acceptable),
            "WARNING" => Some(DocScore::Warning),
            "CRITICAL" => Some(DocScore::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for DocScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-status tally of a rule trace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuleSummary {
    pub pass: usize,
    pub warning: usize,
    pub fail: usize,
    pub not_applicable: usize,
    pub unknown: usize,
}

impl RuleSummary {
    /// Any FAIL is critical; more than two warnings is a warning.
    pub fn doc_score(&self) -> DocScore {
        if self.fail > 0 {
            DocScore::Critical
        } else if self.warning > 2 {
            DocScore::Warning
        } else {
            DocScore::Acceptable
        }
    }
}

/// The model's structured reply. Sections are kept as raw JSON so they
/// can be stored exactly as returned.
#[derive(Debug, Clone, Default)]
pub struct ExtractedInvoice {
    pub raw_extracted_json: Option<Value>,
    pub vendor: Option<Value>,
    pub invoice: Option<Value>,
    pub items: Option<Value>,
    pub amounts: Option<Value>,
    pub classification: Option<Value>,
    pub rule_trace: Option<Value>,
    pub confidence_score: Option<f64>,
    pub doc_score: Option<String>,
}

impl ExtractedInvoice {
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        let Value::Object(mut obj) = value else {
            return Err(ParseError::NoObject);
        };
        let mut take = |key: &str| obj.remove(key).filter(|v| !v.is_null());

        let confidence_score = take("confidence_score")
            .and_then(|v| v.as_f64())
            .filter(|s| (0.0..=100.0).contains(s));
        let doc_score = take("doc_score").and_then(|v| v.as_str().map(str::to_string));

        Ok(Self {
            raw_extracted_json: take("raw_extracted_json"),
            vendor: take("vendor"),
            invoice: take("invoice"),
            items: take("items"),
            amounts: take("amounts"),
            classification: take("classification"),
            rule_trace: take("rule_trace"),
            confidence_score,
            doc_score,
        })
    }

    /// Rule entries that deserialize cleanly; malformed entries are skipped.
    pub fn rules(&self) -> Vec<RuleOutcome> {
        match &self.rule_trace {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn rule_summary(&self) -> RuleSummary {
        self.rules()
            .iter()
            .fold(RuleSummary::default(), |mut acc, rule| {
                match rule.status {
                    RuleStatus::Pass => acc.pass += 1,
                    RuleStatus::Warning => acc.warning += 1,
                    RuleStatus::Fail => acc.fail += 1,
                    RuleStatus::NotApplicable => acc.not_applicable += 1,
                    RuleStatus::Unknown => acc.unknown += 1,
                }
                acc
            })
    }

    /// Document score recomputed from the rule trace.
    pub fn derived_doc_score(&self) -> DocScore {
        self.rule_summary().doc_score()
    }

    /// The model's own score, when it is one of the known values.
    pub fn reported_doc_score(&self) -> Option<DocScore> {
        self.doc_score.as_deref().and_then(DocScore::parse)
    }

    pub fn invoice_number(&self) -> Option<&str> {
        self.invoice
            .as_ref()
            .and_then(|inv| inv.get("invoice_number"))
            .and_then(Value::as_str)
    }

    pub fn vendor_name(&self) -> Option<&str> {
        self.vendor
            .as_ref()
            .and_then(|v| v.get("vendor_name"))
            .and_then(Value::as_str)
    }

    /// How many top-level sections were filled (out of the seven JSON ones).
    pub fn coverage(&self) -> (usize, usize) {
        let filled = [
            &self.raw_extracted_json,
            &self.vendor,
            &self.invoice,
            &self.items,
            &self.amounts,
            &self.classification,
            &self.rule_trace,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count();
        (filled, 7)
    }
}

/// Parse the model's reply into an [`ExtractedInvoice`].
pub fn parse_model_reply(reply: &str) -> Result<ExtractedInvoice, ParseError> {
    // Strip markdown fences if the model added them despite instructions
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json_str = extract_json_object(trimmed).ok_or(ParseError::NoObject)?;
    let value: Value = serde_json::from_str(json_str)?;
    ExtractedInvoice::from_value(value)
}

/// Extract the outermost JSON object from a string that may contain
/// surrounding text (e.g. reasoning preamble).
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&s[start..=end])
}
