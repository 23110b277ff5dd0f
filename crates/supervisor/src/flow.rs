//! Flow state tracking
//!
//! Every run owns one [`FlowState`], held in an injected [`FlowRegistry`]. Each
//! flow sits behind its own async mutex so concurrent branches of the same run
//! never interleave step-counter updates.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{Result, SupervisorError};

/// Lifecycle of a supervisor run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    SequentialStep,
    ParallelFanout,
    Decision,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::SequentialStep => "sequential_step",
            RunState::ParallelFanout => "parallel_fanout",
            RunState::Decision => "decision",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Running) | (Pending, Failed) => true,
            (Running | SequentialStep | ParallelFanout | Decision, next) => matches!(
                next,
                SequentialStep | ParallelFanout | Decision | Completed | Failed
            ),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters reported on flow and step events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub current_phase: String,
    pub active_agents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub flow_id: String,
    pub correlation_id: String,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub current_phase: String,
    pub active_agents: BTreeSet<String>,
    pub run_state: RunState,
    pub last_updated: DateTime<Utc>,
}

impl FlowState {
    pub fn new(
        flow_id: impl Into<String>,
        correlation_id: impl Into<String>,
        total_steps: u32,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            correlation_id: correlation_id.into(),
            total_steps,
            completed_steps: 0,
            current_phase: "initializing".to_string(),
            active_agents: BTreeSet::new(),
            run_state: RunState::Pending,
            last_updated: Utc::now(),
        }
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            total_steps: self.total_steps,
            completed_steps: self.completed_steps,
            current_phase: self.current_phase.clone(),
            active_agents: self.active_agents.iter().cloned().collect(),
        }
    }

    pub fn complete_step(&mut self) -> Result<u32> {
        if self.completed_steps >= self.total_steps {
            return Err(SupervisorError::Validation(format!(
                "flow {} already completed {} of {} steps",
                self.flow_id, self.completed_steps, self.total_steps
            )));
        }
        self.completed_steps += 1;
        self.touch();
        Ok(self.completed_steps)
    }

    pub fn add_steps(&mut self, count: u32) {
        self.total_steps = self.total_steps.saturating_add(count);
        self.touch();
    }

    pub fn set_phase(&mut self, phase: impl Into<String>) {
        self.current_phase = phase.into();
        self.touch();
    }

    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if self.run_state == next {
            return Ok(());
        }
        if !self.run_state.can_transition_to(next) {
            return Err(SupervisorError::InvalidTransition {
                from: self.run_state,
                to: next,
            });
        }
        self.run_state = next;
        self.touch();
        Ok(())
    }

    pub fn agent_started(&mut self, agent_name: &str) {
        self.active_agents.insert(agent_name.to_string());
        self.touch();
    }

    pub fn agent_finished(&mut self, agent_name: &str) {
        self.active_agents.remove(agent_name);
        self.touch();
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Concurrent registry of live flows, keyed by `flow_id`
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: DashMap<String, Arc<Mutex<FlowState>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new flow. Fails if the id is already taken.
    pub fn create(&self, state: FlowState) -> Result<()> {
        let flow_id = state.flow_id.clone();
        match self.flows.entry(flow_id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(SupervisorError::Validation(
                format!("flow {} already exists", entry.key()),
            )),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(state)));
                Ok(())
            }
        }
    }

    fn handle(&self, flow_id: &str) -> Result<Arc<Mutex<FlowState>>> {
        self.flows
            .get(flow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SupervisorError::FlowNotFound(flow_id.to_string()))
    }

    /// Copy of the current state
    pub async fn snapshot(&self, flow_id: &str) -> Result<FlowState> {
        let handle = self.handle(flow_id)?;
        let state = handle.lock().await;
        Ok(state.clone())
    }

    /// Mutate a flow under its lock. Changes made by a failing closure are kept
    /// only up to the point of failure, so closures should validate first.
    pub async fn update<R, F>(&self, flow_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut FlowState) -> Result<R>,
    {
        let handle = self.handle(flow_id)?;
        let mut state = handle.lock().await;
        f(&mut state)
    }

    pub fn remove(&self, flow_id: &str) -> bool {
        self.flows.remove(flow_id).is_some()
    }

    pub fn contains(&self, flow_id: &str) -> bool {
        self.flows.contains_key(flow_id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flow_ids(&self) -> Vec<String> {
        self.flows.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop flows not updated within `idle`. Flows for which `keep` returns
    /// true, and flows whose lock is currently held, are skipped.
    pub fn sweep_idle<K>(&self, idle: Duration, keep: K) -> Vec<String>
    where
        K: Fn(&str) -> bool,
    {
        let cutoff = match chrono::Duration::from_std(idle) {
            Ok(idle) => Utc::now() - idle,
            Err(_) => return Vec::new(),
        };

        let expired: Vec<String> = self
            .flows
            .iter()
            .filter_map(|entry| {
                if keep(entry.key().as_str()) {
                    return None;
                }
                let state = entry.value().try_lock().ok()?;
                (state.last_updated < cutoff).then(|| entry.key().clone())
            })
            .collect();

        for flow_id in &expired {
            self.flows.remove(flow_id);
            tracing::info!("[FLOW_REGISTRY] Swept idle flow {}", flow_id);
        }

        expired
    }
}
