//! Collaborator contracts consumed by the supervisor
//!
//! Sub-agent execution and conversation threads live outside this crate. The
//! server wires HTTP-backed implementations; tests use scripted ones.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Error text that no retry or substitute can fix
pub(crate) const NON_RECOVERABLE_MARKERS: &[&str] = &[
    "authentication",
    "authorization",
    "permission_denied",
    "system_shutdown",
];

pub(crate) fn has_non_recoverable_marker(text: &str) -> bool {
    let lowered = text.to_lowercase();
    NON_RECOVERABLE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub run_id: String,
    pub response: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    Recoverable,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentExecutionError {
    pub agent_name: String,
    pub message: String,
    pub kind: AgentErrorKind,
}

impl AgentExecutionError {
    /// Classify by message: non-recoverable markers make the error terminal
    pub fn new(agent_name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if has_non_recoverable_marker(&message) {
            AgentErrorKind::Terminal
        } else {
            AgentErrorKind::Recoverable
        };
        Self {
            agent_name: agent_name.into(),
            message,
            kind,
        }
    }

    pub fn terminal(agent_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            message: message.into(),
            kind: AgentErrorKind::Terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == AgentErrorKind::Terminal
    }
}

impl fmt::Display for AgentExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent '{}' failed: {}", self.agent_name, self.message)
    }
}

impl std::error::Error for AgentExecutionError {}

#[async_trait]
pub trait AgentService: Send + Sync {
    async fn execute_agent(
        &self,
        agent_name: &str,
        thread_id: Option<&str>,
        input: &Value,
        config: &Value,
    ) -> Result<AgentResponse, AgentExecutionError>;
}

#[async_trait]
pub trait ThreadService: Send + Sync {
    /// `None` when the thread subsystem is unavailable
    async fn create_thread(&self, title: &str, metadata: &Value) -> Option<String>;
}

/// Process-local thread store
#[derive(Debug, Default)]
pub struct InMemoryThreadService {
    threads: DashMap<String, (String, Value)>,
}

impl InMemoryThreadService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(&self, thread_id: &str) -> Option<String> {
        self.threads.get(thread_id).map(|entry| entry.0.clone())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[async_trait]
impl ThreadService for InMemoryThreadService {
    async fn create_thread(&self, title: &str, metadata: &Value) -> Option<String> {
        let thread_id = format!("thread_{}", Uuid::new_v4().simple());
        self.threads
            .insert(thread_id.clone(), (title.to_string(), metadata.clone()));
        Some(thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_kind_from_message() {
        assert!(AgentExecutionError::new("data", "Authentication expired").is_terminal());
        assert!(!AgentExecutionError::new("data", "upstream 503").is_terminal());
        assert!(AgentExecutionError::terminal("data", "bad input").is_terminal());
    }

    #[test]
    fn test_error_classification_agrees_with_recovery_check() {
        let resolver = crate::fallback::FallbackStrategyResolver::new();
        for marker in NON_RECOVERABLE_MARKERS {
            let message = format!("upstream said {}", marker.to_uppercase());
            assert!(AgentExecutionError::new("data", message.as_str()).is_terminal());
            assert!(!resolver.should_attempt_recovery(&message, "data"));
        }
    }

    #[test]
    fn test_error_display() {
        let err = AgentExecutionError::new("triage", "timeout talking to llm");
        assert_eq!(err.to_string(), "agent 'triage' failed: timeout talking to llm");
    }

    #[tokio::test]
    async fn test_in_memory_threads() {
        let threads = InMemoryThreadService::new();
        let id = threads
            .create_thread("Cost review", &json!({"user_id": "u1"}))
            .await
            .unwrap();

        assert_eq!(threads.title(&id).as_deref(), Some("Cost review"));
        assert_eq!(threads.len(), 1);
    }
}
