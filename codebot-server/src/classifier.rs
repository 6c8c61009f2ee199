//! Intent classification of review comments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::agent::{extract_json_object, CodeAgent};
use crate::prompt::{classification_prompt, nitpick_prompt, PrContext};

pub const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(30);
pub const NITPICK_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_CLARIFICATION: &str = "Could you clarify what you would like me to do here?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Query,
    ChangeRequest,
    Appreciation,
    Nitpick,
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    pub reasoning: Option<String>,
    /// Only meaningful for `Intent::Ambiguous`.
    pub clarification_question: Option<String>,
}

impl Classification {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            reasoning: None,
            clarification_question: None,
        }
    }

    /// Safe default when classification fails.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            intent: Intent::Query,
            reasoning: Some(reason.into()),
            clarification_question: None,
        }
    }

    pub fn clarification_question(&self) -> &str {
        self.clarification_question
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(DEFAULT_CLARIFICATION)
    }
}

#[derive(Deserialize)]
struct RawClassification {
    #[serde(rename = "type")]
    intent: Intent,
    reasoning: Option<String>,
    clarification_question: Option<String>,
}

/// Parse a model response; unknown shapes fall back to a query.
pub fn parse_classification(response: &str) -> Classification {
    let Some(json) = extract_json_object(response) else {
        return Classification::fallback("Parse failed");
    };
    match serde_json::from_str::<RawClassification>(json) {
        Ok(raw) => Classification {
            intent: raw.intent,
            reasoning: raw.reasoning,
            clarification_question: raw.clarification_question,
        },
        Err(e) => Classification::fallback(format!("Parse failed: {}", e)),
    }
}

/// Result of weighing a nitpick.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NitpickAnalysis {
    #[serde(default)]
    pub agrees: bool,
    #[serde(default)]
    pub reasoning: String,
}

pub fn parse_nitpick_analysis(response: &str) -> Option<NitpickAnalysis> {
    serde_json::from_str(extract_json_object(response)?).ok()
}

/// Decides what a reviewer wants from a comment.
///
/// Implementations never fail: any problem degrades to a fallback.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, comment: &str, context: &PrContext) -> Classification;

    /// `None` when no analysis could be produced.
    async fn analyze_nitpick(&self, comment: &str, context: &PrContext)
        -> Option<NitpickAnalysis>;
}

/// Asks the agent command for a JSON verdict.
pub struct CommandClassifier {
    agent: Arc<dyn CodeAgent>,
}

impl CommandClassifier {
    pub fn new(agent: Arc<dyn CodeAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Classifier for CommandClassifier {
    async fn classify(&self, comment: &str, context: &PrContext) -> Classification {
        let prompt = classification_prompt(comment, context);
        match self.agent.ask(&prompt, CLASSIFY_TIMEOUT).await {
            Ok(response) => {
                let classification = parse_classification(&response);
                info!(
                    "Classified comment as {:?} ({})",
                    classification.intent,
                    classification.reasoning.as_deref().unwrap_or("no reasoning")
                );
                classification
            }
            Err(e) => {
                warn!("Classification failed, defaulting to query: {:#}", e);
                Classification::fallback(format!("Error: {}", e))
            }
        }
    }

    async fn analyze_nitpick(
        &self,
        comment: &str,
        context: &PrContext,
    ) -> Option<NitpickAnalysis> {
        let prompt = nitpick_prompt(comment, context);
        match self.agent.ask(&prompt, NITPICK_TIMEOUT).await {
            Ok(response) => parse_nitpick_analysis(&response),
            Err(e) => {
                warn!("Nitpick analysis failed: {:#}", e);
                None
            }
        }
    }
}

/// Deterministic keyword rules. Used in tests and when no model is available.
pub struct KeywordClassifier;

const NITPICK_MARKERS: &[&str] = &["nit:", "nit ", "nitpick", "minor:", "consider ", "maybe "];
const APPRECIATION_MARKERS: &[&str] = &[
    "lgtm",
    "looks good",
    "thank",
    "nice",
    "great",
    "well done",
    "approved",
];
const CHANGE_MARKERS: &[&str] = &[
    "please", "should", "must", "change", "rename", "remove", "add ", "fix", "replace", "use ",
];
const QUESTION_STARTS: &[&str] = &[
    "why", "what", "how", "when", "where", "which", "is ", "does ", "can ",
];

impl KeywordClassifier {
    pub fn classify_text(comment: &str) -> Classification {
        let text = comment.trim().to_lowercase();
        if text.is_empty() {
            return Classification::new(Intent::Query);
        }

        if NITPICK_MARKERS.iter().any(|m| text.starts_with(m) || text.contains(m)) {
            return Classification::new(Intent::Nitpick);
        }
        if text.ends_with('?') || QUESTION_STARTS.iter().any(|q| text.starts_with(q)) {
            return Classification::new(Intent::Query);
        }
        if CHANGE_MARKERS.iter().any(|m| text.contains(m)) {
            return Classification::new(Intent::ChangeRequest);
        }
        if APPRECIATION_MARKERS.iter().any(|m| text.contains(m)) {
            return Classification::new(Intent::Appreciation);
        }

        Classification {
            intent: Intent::Ambiguous,
            reasoning: Some("no keyword matched".to_string()),
            clarification_question: Some(DEFAULT_CLARIFICATION.to_string()),
        }
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, comment: &str, _context: &PrContext) -> Classification {
        Self::classify_text(comment)
    }

    async fn analyze_nitpick(
        &self,
        _comment: &str,
        _context: &PrContext,
    ) -> Option<NitpickAnalysis> {
        None
    }
}
