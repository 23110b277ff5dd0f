//! Supervisor progress events
//!
//! Builders compose the common envelope (`type`, `flow_id`, `correlation_id`,
//! `timestamp`) with variant fields. They only read a [`FlowState`]; the
//! [`FlowEventRecorder`] resolves the flow through the registry first so an
//! event can never reference a flow that does not exist.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::flow::{FlowRegistry, FlowState, StateSummary};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Fallback,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Error,
}

/// Variant payloads, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "supervisor_flow")]
    Flow {
        event: String,
        state_summary: StateSummary,
    },

    #[serde(rename = "supervisor_step")]
    Step {
        step_name: String,
        step_number: u32,
        status: StepStatus,
        state_summary: StateSummary,
    },

    #[serde(rename = "supervisor_decision")]
    Decision {
        decision_point: String,
        chosen_path: String,
    },

    #[serde(rename = "supervisor_parallel")]
    Parallel {
        agent_names: Vec<String>,
        agent_count: usize,
    },

    #[serde(rename = "supervisor_sequential")]
    Sequential {
        agent_sequence: Vec<String>,
        sequence_length: usize,
    },

    #[serde(rename = "supervisor_retry")]
    Retry {
        step_name: String,
        attempt_number: u32,
        reason: String,
    },

    #[serde(rename = "supervisor_fallback")]
    Fallback {
        failed_step: String,
        fallback_step: String,
        reason: String,
    },

    #[serde(rename = "agent_completed")]
    AgentCompleted {
        run_id: String,
        status: CompletionStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::Flow { .. } => "supervisor_flow",
            EventKind::Step { .. } => "supervisor_step",
            EventKind::Decision { .. } => "supervisor_decision",
            EventKind::Parallel { .. } => "supervisor_parallel",
            EventKind::Sequential { .. } => "supervisor_sequential",
            EventKind::Retry { .. } => "supervisor_retry",
            EventKind::Fallback { .. } => "supervisor_fallback",
            EventKind::AgentCompleted { .. } => "agent_completed",
        }
    }
}

/// A write-once progress record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorEvent {
    pub flow_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SupervisorEvent {
    fn from_flow(state: &FlowState, kind: EventKind) -> Self {
        Self {
            flow_id: state.flow_id.clone(),
            correlation_id: state.correlation_id.clone(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    /// The common envelope fields
    pub fn envelope(&self) -> (&str, &str, DateTime<Utc>) {
        (&self.flow_id, &self.correlation_id, self.timestamp)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::AgentCompleted { .. })
    }
}

pub fn flow_event(state: &FlowState, event: &str) -> SupervisorEvent {
    SupervisorEvent::from_flow(
        state,
        EventKind::Flow {
            event: event.to_string(),
            state_summary: state.summary(),
        },
    )
}

pub fn step_event(
    state: &FlowState,
    step_name: &str,
    step_number: u32,
    status: StepStatus,
) -> SupervisorEvent {
    SupervisorEvent::from_flow(
        state,
        EventKind::Step {
            step_name: step_name.to_string(),
            step_number,
            status,
            state_summary: state.summary(),
        },
    )
}

pub fn decision_event(state: &FlowState, decision_point: &str, chosen_path: &str) -> SupervisorEvent {
    SupervisorEvent::from_flow(
        state,
        EventKind::Decision {
            decision_point: decision_point.to_string(),
            chosen_path: chosen_path.to_string(),
        },
    )
}

pub fn parallel_event(state: &FlowState, agent_names: &[String]) -> SupervisorEvent {
    SupervisorEvent::from_flow(
        state,
        EventKind::Parallel {
            agent_names: agent_names.to_vec(),
            agent_count: agent_names.len(),
        },
    )
}

pub fn sequential_event(state: &FlowState, agent_sequence: &[String]) -> SupervisorEvent {
    SupervisorEvent::from_flow(
        state,
        EventKind::Sequential {
            agent_sequence: agent_sequence.to_vec(),
            sequence_length: agent_sequence.len(),
        },
    )
}

pub fn retry_event(
    state: &FlowState,
    step_name: &str,
    attempt_number: u32,
    reason: &str,
) -> SupervisorEvent {
    SupervisorEvent::from_flow(
        state,
        EventKind::Retry {
            step_name: step_name.to_string(),
            attempt_number,
            reason: reason.to_string(),
        },
    )
}

pub fn fallback_event(
    state: &FlowState,
    failed_step: &str,
    fallback_step: &str,
    reason: &str,
) -> SupervisorEvent {
    SupervisorEvent::from_flow(
        state,
        EventKind::Fallback {
            failed_step: failed_step.to_string(),
            fallback_step: fallback_step.to_string(),
            reason: reason.to_string(),
        },
    )
}

pub fn completion_event(
    state: &FlowState,
    run_id: &str,
    status: CompletionStatus,
    error: Option<String>,
) -> SupervisorEvent {
    SupervisorEvent::from_flow(
        state,
        EventKind::AgentCompleted {
            run_id: run_id.to_string(),
            status,
            error,
        },
    )
}

/// Builds events against flows held in a [`FlowRegistry`]
#[derive(Debug, Clone)]
pub struct FlowEventRecorder {
    registry: Arc<FlowRegistry>,
}

impl FlowEventRecorder {
    pub fn new(registry: Arc<FlowRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// Snapshot the flow and hand it to `build`. Returns `FlowNotFound` when the
    /// flow is unknown.
    pub async fn record<F>(&self, flow_id: &str, build: F) -> Result<SupervisorEvent>
    where
        F: FnOnce(&FlowState) -> SupervisorEvent,
    {
        let state = self.registry.snapshot(flow_id).await?;
        Ok(build(&state))
    }
}

/// Fans supervisor events out to every subscriber (SSE streams, tests)
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Broadcast an event to all subscribers
    pub fn broadcast(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
