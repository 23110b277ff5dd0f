//! Keyword and pattern substitutes for failed sub-agents

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::reliability::FailureReason;
use crate::services::has_non_recoverable_marker;

/// Intent categories in priority order. Ties go to the earlier entry.
const INTENT_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "cost_optimization",
        &["cost", "spend", "budget", "expensive", "cheaper", "price", "billing", "save"],
    ),
    (
        "performance_optimization",
        &["latency", "slow", "performance", "throughput", "speed", "faster", "optimize"],
    ),
    (
        "failure_analysis",
        &["error", "fail", "failure", "crash", "broken", "exception", "outage", "timeout"],
    ),
    (
        "usage_analysis",
        &["usage", "trend", "volume", "requests", "traffic", "consumption", "tokens"],
    ),
    (
        "model_selection",
        &["model", "switch", "compare", "which llm", "best model", "alternative"],
    ),
];

pub const GENERAL_INQUIRY: &str = "general_inquiry";

static ENTITY_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        (
            "model_name",
            r"(?i)\b((?:gpt|claude|gemini|mistral|llama)-?[a-z0-9][a-z0-9.\-]*)",
        ),
        (
            "provider",
            r"(?i)\b(openai|anthropic|google|azure|bedrock|cohere|mistral)\b",
        ),
        (
            "metric",
            r"(?i)\b(latency|throughput|error rate|cost|tokens|usage|accuracy)\b",
        ),
        (
            "time_range",
            r"(?i)\b((?:last|past|previous)\s+(?:\d+\s+)?(?:hour|day|week|month|quarter|year)s?)\b",
        ),
        ("percentage", r"(\d+(?:\.\d+)?)\s?%"),
        ("cost_amount", r"\$\s?(\d{1,3}(?:,\d{3})*(?:\.\d+)?|\d+(?:\.\d+)?)"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid entity regex")))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMatch {
    pub intent: String,
    pub score: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityExtraction {
    pub extracted: BTreeMap<String, String>,
    pub failed: Vec<String>,
}

/// A substitute result for a failed agent step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackOutcome {
    pub strategy: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct FallbackStrategyResolver;

impl FallbackStrategyResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_intent(&self, text: &str) -> IntentMatch {
        let lowered = text.to_lowercase();
        let mut best: Option<(&str, usize)> = None;

        for (intent, keywords) in INTENT_KEYWORDS {
            let score = keywords.iter().filter(|k| lowered.contains(*k)).count();
            // strictly greater keeps the first-declared intent on ties
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((intent, score));
            }
        }

        match best {
            Some((intent, score)) => IntentMatch {
                intent: intent.to_string(),
                score,
                confidence: (0.4 + 0.15 * score as f64).min(0.9),
            },
            None => IntentMatch {
                intent: GENERAL_INQUIRY.to_string(),
                score: 0,
                confidence: 0.2,
            },
        }
    }

    pub fn extract_entities(&self, text: &str) -> EntityExtraction {
        let mut extraction = EntityExtraction::default();
        for (name, pattern) in ENTITY_PATTERNS.iter() {
            match pattern
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
            {
                Some(value) => {
                    extraction.extracted.insert(name.to_string(), value);
                }
                None => extraction.failed.push(name.to_string()),
            }
        }
        extraction
    }

    pub fn recommend_tools(&self, intent: &str) -> Vec<&'static str> {
        match intent {
            "cost_optimization" => vec!["cost_analyzer", "usage_report", "pricing_lookup"],
            "performance_optimization" => {
                vec!["latency_analyzer", "throughput_report", "cache_advisor"]
            }
            "failure_analysis" => vec!["error_log_search", "incident_timeline", "retry_advisor"],
            "usage_analysis" => vec!["usage_report", "trend_analyzer"],
            "model_selection" => vec!["model_catalog", "benchmark_lookup", "pricing_lookup"],
            _ => vec!["general_search", "usage_report"],
        }
    }

    /// False when the error belongs to a class that retrying cannot fix
    pub fn should_attempt_recovery(&self, error: &str, operation: &str) -> bool {
        let terminal = has_non_recoverable_marker(error);
        if terminal {
            tracing::warn!(
                "[FALLBACK] {} hit a non-recoverable error, skipping recovery: {}",
                operation,
                error
            );
        }
        !terminal
    }

    /// Recovery check on a guarded failure. Only the error text is inspected;
    /// timeouts and panics are always recoverable.
    pub fn is_recoverable(&self, failure: &FailureReason) -> bool {
        match failure.error_message() {
            Some(message) => self.should_attempt_recovery(message, failure.operation()),
            None => true,
        }
    }

    /// Produce a substitute for `agent_name` when one exists and the failure is
    /// recoverable. `metadata` is the parent's merged results so far.
    pub fn resolve(
        &self,
        agent_name: &str,
        input: &Value,
        metadata: &HashMap<String, Value>,
        failure: &FailureReason,
    ) -> Option<FallbackOutcome> {
        if !self.is_recoverable(failure) {
            return None;
        }

        let text = input_text(input);
        let (strategy, value) = match agent_name {
            "triage" => {
                let intent = self.classify_intent(&text);
                let entities = self.extract_entities(&text);
                let tools = self.recommend_tools(&intent.intent);
                (
                    "triage_keyword_fallback",
                    json!({
                        "category": intent.intent,
                        "confidence": intent.confidence,
                        "entities": entities.extracted,
                        "failed_entities": entities.failed,
                        "recommended_tools": tools,
                        "fallback": true,
                    }),
                )
            }
            "data" => (
                "data_empty_fallback",
                json!({
                    "status": "unavailable",
                    "records": [],
                    "summary": "Data collection was unavailable; continuing without metrics",
                    "fallback": true,
                }),
            ),
            "optimization" => (
                "optimization_generic_fallback",
                json!({
                    "recommendations": [
                        "Review the highest-volume workloads for caching opportunities",
                        "Route simple requests to a smaller model",
                        "Batch non-interactive requests",
                    ],
                    "fallback": true,
                }),
            ),
            "actions" => (
                "actions_conservative_fallback",
                json!({
                    "action_plan": [
                        {"step": "review_recommendations", "automated": false},
                        {"step": "schedule_follow_up", "automated": false},
                    ],
                    "requires_approval": true,
                    "fallback": true,
                }),
            ),
            "reporting" => {
                let mut sections: Vec<&String> = metadata.keys().collect();
                sections.sort();
                (
                    "reporting_template_fallback",
                    json!({
                        "summary": format!(
                            "Partial report assembled from {} completed analyses",
                            sections.len()
                        ),
                        "sections": sections,
                        "fallback": true,
                    }),
                )
            }
            _ => return None,
        };

        tracing::info!(
            "[FALLBACK] Using {} for agent {} after: {}",
            strategy,
            agent_name,
            failure
        );

        Some(FallbackOutcome {
            strategy: strategy.to_string(),
            value,
        })
    }
}

/// Best-effort text view of an agent input
fn input_text(input: &Value) -> String {
    match input {
        Value::String(text) => text.clone(),
        Value::Object(map) => ["message", "query", "text", "user_request"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| input.to_string()),
        other => other.to_string(),
    }
}
