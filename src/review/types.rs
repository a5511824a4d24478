//! Result contracts exchanged between stages, the pipeline and the tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::utils::extract_json_object;

/// Keys whose string arrays are folded into [`ValidationResult::issues`].
const ISSUE_KEYS: &[&str] = &[
    "issues",
    "syntax_issues",
    "logic_concerns",
    "missing_requirements",
    "testability_issues",
    "coverage_gaps",
    "test_quality_issues",
    "integration_issues",
];

/// Maximum characters of a raw response quoted back in feedback.
const RESPONSE_EXCERPT_CHARS: usize = 200;

/// One stage's verdict on the previous stage's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Confidence in the verdict, in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub feedback: String,
    pub can_proceed: bool,
}

impl ValidationResult {
    /// An accepting verdict with full confidence.
    pub fn accept(feedback: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            confidence: 1.0,
            issues: Vec::new(),
            feedback: feedback.into(),
            can_proceed: true,
        }
    }

    /// A rejecting verdict.
    pub fn reject(feedback: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            is_valid: false,
            confidence: 1.0,
            issues,
            feedback: feedback.into(),
            can_proceed: false,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    /// Parse a verdict from a completion response.
    ///
    /// The JSON object may be surrounded by prose or wrapped in a code block.
    /// A response without JSON yields an invalid verdict with confidence 0.5;
    /// malformed JSON yields an invalid verdict with confidence 0.0.
    pub fn from_response(response: &str) -> Self {
        let Some(json) = extract_json_object(response) else {
            warn!(excerpt = %excerpt(response), "Validation response contained no JSON");
            return Self {
                is_valid: false,
                confidence: 0.5,
                issues: vec!["Response format was not JSON".to_string()],
                feedback: format!(
                    "The validation response was not in the expected JSON format. Response: {}",
                    excerpt(response)
                ),
                can_proceed: false,
            };
        };

        let data = match serde_json::from_str::<Value>(&json) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Self::malformed(response, "expected a JSON object"),
            Err(e) => return Self::malformed(response, &e.to_string()),
        };

        let is_valid = data.get("is_valid").and_then(Value::as_bool).unwrap_or(false);
        let confidence = data
            .get("confidence")
            .and_then(Value::as_f64)
            .map(clamp_confidence)
            .unwrap_or(0.0);
        let feedback = data
            .get("feedback")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let can_proceed = data
            .get("can_proceed")
            .and_then(Value::as_bool)
            .or_else(|| {
                data.iter()
                    .find(|(key, _)| key.starts_with("can_"))
                    .and_then(|(_, value)| value.as_bool())
            })
            .unwrap_or(is_valid);

        let mut issues: Vec<String> = Vec::new();
        for key in ISSUE_KEYS {
            if let Some(items) = data.get(*key).and_then(Value::as_array) {
                for item in items.iter().filter_map(Value::as_str) {
                    let item = item.trim();
                    if !item.is_empty() && !issues.iter().any(|existing| existing == item) {
                        issues.push(item.to_string());
                    }
                }
            }
        }

        Self {
            is_valid,
            confidence,
            issues,
            feedback,
            can_proceed,
        }
    }

    fn malformed(response: &str, reason: &str) -> Self {
        warn!(error = %reason, "Validation response was malformed");
        Self {
            is_valid: false,
            confidence: 0.0,
            issues: vec![format!("Failed to parse validation response: {}", reason)],
            feedback: format!(
                "Validation response was malformed. Error: {}. Response: {}",
                reason,
                excerpt(response)
            ),
            can_proceed: false,
        }
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(RESPONSE_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Outcome of one stage execution inside a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub content: String,
    pub stage: String,
    pub task_id: String,
    /// Wall-clock time spent in validate and work, in seconds.
    pub execution_time: f64,
    pub validation_performed: bool,
    pub validation_result: Option<ValidationResult>,
    pub feedback_for_previous_agent: Option<String>,
    pub should_retry_previous: bool,
    /// Number of retries of the previous stage this result needed.
    pub retry_attempt: u32,
}

impl AgentResult {
    pub fn new(stage: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            stage: stage.into(),
            task_id: task_id.into(),
            execution_time: 0.0,
            validation_performed: false,
            validation_result: None,
            feedback_for_previous_agent: None,
            should_retry_previous: false,
            retry_attempt: 0,
        }
    }

    /// Attach a validation verdict. A rejection flags a retry request; an
    /// acceptance clears any request left by an earlier verdict.
    pub fn with_validation(mut self, validation: ValidationResult) -> Self {
        self.validation_performed = true;
        self.should_retry_previous = !validation.is_valid;
        self.feedback_for_previous_agent =
            (!validation.is_valid).then(|| validation.feedback.clone());
        self.validation_result = Some(validation);
        self
    }
}

/// A critique sent from one stage to the stage before it.
///
/// Immutable once recorded, except for `retry_successful`, which the tracker
/// sets exactly once when the matching retry is re-validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    /// Key retry-outcome log records point at.
    #[serde(default = "new_entry_id")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub from_stage: String,
    pub to_stage: String,
    pub task_id: String,
    pub feedback: String,
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub retry_successful: Option<bool>,
}

fn new_entry_id() -> String {
    format!("FB-{}", Uuid::new_v4().simple())
}

impl FeedbackEntry {
    /// Build an entry from a rejecting verdict.
    pub fn from_validation(
        from_stage: impl Into<String>,
        to_stage: impl Into<String>,
        task_id: impl Into<String>,
        validation: &ValidationResult,
    ) -> Self {
        Self {
            id: new_entry_id(),
            timestamp: Utc::now(),
            from_stage: from_stage.into(),
            to_stage: to_stage.into(),
            task_id: task_id.into(),
            feedback: validation.feedback.clone(),
            confidence: validation.confidence,
            issues: validation.issues.clone(),
            retry_successful: None,
        }
    }
}
