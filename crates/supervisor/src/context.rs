//! Execution context for a supervisor run and the child-result merge rule

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of a run plus the metadata accumulated from its sub-agents.
///
/// Identity fields are fixed at construction. A parent context's metadata is
/// only changed through [`ResultKeyMap::merge_child_result`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    user_id: String,
    thread_id: Option<String>,
    run_id: String,
    request_id: String,
    correlation_id: String,
    metadata: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(user_id: impl Into<String>, thread_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id,
            run_id: format!("run_{}", Uuid::new_v4()),
            request_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Derive the context a sub-agent runs in: same user, thread, request and
    /// correlation, a fresh run id and empty metadata.
    pub fn child(&self, agent_name: &str) -> Self {
        Self {
            user_id: self.user_id.clone(),
            thread_id: self.thread_id.clone(),
            run_id: format!("run_{}_{}", agent_name, Uuid::new_v4().simple()),
            request_id: self.request_id.clone(),
            correlation_id: self.correlation_id.clone(),
            metadata: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Store an agent's output on a child context ahead of merging.
    pub fn record_result(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

/// Declared mapping of agent name to the metadata keys it is allowed to publish
/// into its parent. Keys are namespaced per agent so concurrent branches never
/// write the same key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultKeyMap {
    table: BTreeMap<String, Vec<String>>,
}

impl Default for ResultKeyMap {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        for (agent, key) in [
            ("triage", "triage_result"),
            ("data", "data_result"),
            ("optimization", "optimizations_result"),
            ("actions", "action_plan_result"),
            ("reporting", "report_result"),
            ("synthetic_data", "synthetic_data_result"),
            ("corpus_admin", "corpus_admin_result"),
        ] {
            table.insert(agent.to_string(), vec![key.to_string()]);
        }
        Self { table }
    }
}

impl ResultKeyMap {
    pub fn empty() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// Declare (or replace) the result keys for an agent
    pub fn declare(&mut self, agent_name: impl Into<String>, keys: Vec<String>) {
        self.table.insert(agent_name.into(), keys);
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>, keys: Vec<String>) -> Self {
        self.declare(agent_name, keys);
        self
    }

    pub fn keys_for(&self, agent_name: &str) -> &[String] {
        self.table
            .get(agent_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The key an agent's whole response is stored under
    pub fn primary_key(&self, agent_name: &str) -> Option<&str> {
        self.keys_for(agent_name).first().map(String::as_str)
    }

    pub fn contains(&self, agent_name: &str) -> bool {
        self.table.contains_key(agent_name)
    }

    /// Copy every declared key present in `child` into `parent`, last writer wins.
    /// Returns the keys that were copied.
    pub fn merge_child_result(
        &self,
        parent: &mut ExecutionContext,
        child: &ExecutionContext,
        agent_key: &str,
    ) -> Vec<String> {
        let mut merged = Vec::new();
        for key in self.keys_for(agent_key) {
            if let Some(value) = child.metadata.get(key) {
                parent.metadata.insert(key.clone(), value.clone());
                merged.push(key.clone());
            }
        }

        if merged.is_empty() {
            tracing::debug!(
                "[CONTEXT] No declared result keys from '{}' present on child {}",
                agent_key,
                child.run_id
            );
        }

        merged
    }
}

static DEFAULT_RESULT_KEYS: Lazy<ResultKeyMap> = Lazy::new(ResultKeyMap::default);

/// Merge using the built-in agent table
pub fn merge_child_result(
    parent: &mut ExecutionContext,
    child: &ExecutionContext,
    agent_key: &str,
) -> Vec<String> {
    DEFAULT_RESULT_KEYS.merge_child_result(parent, child, agent_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_shares_identity_but_not_run() {
        let parent = ExecutionContext::new("user-1", Some("thread-1".to_string()))
            .with_request_id("req-1");
        let child = parent.child("triage");

        assert_eq!(child.user_id(), "user-1");
        assert_eq!(child.thread_id(), Some("thread-1"));
        assert_eq!(child.request_id(), "req-1");
        assert_eq!(child.correlation_id(), parent.correlation_id());
        assert_ne!(child.run_id(), parent.run_id());
        assert!(child.metadata().is_empty());
    }

    #[test]
    fn test_merge_copies_only_declared_keys() {
        let mut parent = ExecutionContext::new("user-1", None);
        let mut child = parent.child("triage");
        child.record_result("triage_result", json!({"category": "cost_optimization"}));
        child.record_result("scratch", json!("ignored"));

        let merged = merge_child_result(&mut parent, &child, "triage");

        assert_eq!(merged, vec!["triage_result".to_string()]);
        assert_eq!(
            parent.get("triage_result"),
            Some(&json!({"category": "cost_optimization"}))
        );
        assert!(parent.get("scratch").is_none());
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut parent = ExecutionContext::new("user-1", None);

        let mut first = parent.child("data");
        first.record_result("data_result", json!({"rows": 1}));
        merge_child_result(&mut parent, &first, "data");

        let mut second = parent.child("data");
        second.record_result("data_result", json!({"rows": 2}));
        merge_child_result(&mut parent, &second, "data");

        assert_eq!(parent.get("data_result"), Some(&json!({"rows": 2})));
    }

    #[test]
    fn test_unknown_agent_merges_nothing() {
        let mut parent = ExecutionContext::new("user-1", None);
        let mut child = parent.child("mystery");
        child.record_result("mystery_result", json!(true));

        assert!(merge_child_result(&mut parent, &child, "mystery").is_empty());
        assert!(parent.metadata().is_empty());
    }

    #[test]
    fn test_declared_agent_extends_table() {
        let keys = ResultKeyMap::default()
            .with_agent("pricing", vec!["pricing_result".to_string()]);
        let mut parent = ExecutionContext::new("user-1", None);
        let mut child = parent.child("pricing");
        child.record_result("pricing_result", json!(42));

        keys.merge_child_result(&mut parent, &child, "pricing");

        assert_eq!(keys.primary_key("pricing"), Some("pricing_result"));
        assert_eq!(parent.get("pricing_result"), Some(&json!(42)));
    }
}
