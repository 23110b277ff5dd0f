//! Scripted collaborators shared by the engine and router tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};

use crate::config::SupervisorConfig;
use crate::connection::{ConnectionManager, Transport, TransportError};
use crate::engine::SupervisorEngine;
use crate::events::{EventKind, StepStatus, SupervisorEvent};
use crate::flow::FlowRegistry;
use crate::reliability::ReliabilityExecutor;
use crate::router::MessageRouter;
use crate::services::{
    AgentExecutionError, AgentResponse, AgentService, InMemoryThreadService, ThreadService,
};

#[derive(Debug, Clone)]
pub enum Behavior {
    Respond(Value),
    Fail(String),
    Hang,
    Delay(Duration, Value),
    WaitFor(Arc<Notify>, Value),
}

/// Agent service that plays back a per-agent script. The last behavior of a
/// script repeats; agents without a script echo their name.
#[derive(Debug, Default)]
pub struct ScriptedAgents {
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedAgents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, agent: &str, behaviors: Vec<Behavior>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(agent.to_string(), behaviors.into());
        self
    }

    pub fn call_count(&self, agent: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|name| name.as_str() == agent)
            .count()
    }

    fn next_behavior(&self, agent: &str) -> Behavior {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(agent) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Behavior::Respond(json!({ "agent": agent })),
        }
    }
}

#[async_trait]
impl AgentService for ScriptedAgents {
    async fn execute_agent(
        &self,
        agent_name: &str,
        _thread_id: Option<&str>,
        _input: &Value,
        _config: &Value,
    ) -> Result<AgentResponse, AgentExecutionError> {
        self.calls.lock().unwrap().push(agent_name.to_string());
        let behavior = self.next_behavior(agent_name);

        let response = match behavior {
            Behavior::Respond(value) => value,
            Behavior::Fail(message) => return Err(AgentExecutionError::new(agent_name, message)),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Value::Null
            }
            Behavior::Delay(delay, value) => {
                tokio::time::sleep(delay).await;
                value
            }
            Behavior::WaitFor(notify, value) => {
                notify.notified().await;
                value
            }
        };

        Ok(AgentResponse {
            run_id: format!("agent_run_{}", agent_name),
            response,
        })
    }
}

/// Thread service that is always down
pub struct UnavailableThreads;

#[async_trait]
impl ThreadService for UnavailableThreads {
    async fn create_thread(&self, _title: &str, _metadata: &Value) -> Option<String> {
        None
    }
}

/// Thread service that never answers
pub struct HangingThreads;

#[async_trait]
impl ThreadService for HangingThreads {
    async fn create_thread(&self, _title: &str, _metadata: &Value) -> Option<String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Some("thread_late".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Deliver,
    Closed,
    Hang,
}

#[derive(Debug)]
pub struct RecordingTransport {
    mode: TransportMode,
    sent: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new(mode: TransportMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        match self.mode {
            TransportMode::Deliver => {
                self.sent.lock().unwrap().push(text);
                Ok(())
            }
            TransportMode::Closed => Err(TransportError::Closed),
            TransportMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

pub fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        step_timeout_ms: 2_000,
        max_attempts: 2,
        send_timeout_ms: 100,
        ..SupervisorConfig::default()
    }
}

pub fn router(connections: Arc<ConnectionManager>) -> Arc<MessageRouter> {
    Arc::new(MessageRouter::new(
        connections,
        ReliabilityExecutor::new(),
        Duration::from_millis(100),
    ))
}

pub struct Harness {
    pub engine: Arc<SupervisorEngine>,
    pub agents: Arc<ScriptedAgents>,
    pub connections: Arc<ConnectionManager>,
    pub flows: Arc<FlowRegistry>,
}

pub fn harness(agents: ScriptedAgents, config: SupervisorConfig) -> Harness {
    harness_with_threads(agents, config, Arc::new(InMemoryThreadService::new()))
}

pub fn harness_with_threads(
    agents: ScriptedAgents,
    config: SupervisorConfig,
    threads: Arc<dyn ThreadService>,
) -> Harness {
    let agents = Arc::new(agents);
    let connections = Arc::new(ConnectionManager::new());
    let flows = Arc::new(FlowRegistry::new());
    let engine = Arc::new(SupervisorEngine::new(
        agents.clone(),
        threads,
        router(connections.clone()),
        flows.clone(),
        config,
    ));
    Harness {
        engine,
        agents,
        connections,
        flows,
    }
}

/// Collect events until the run's terminal `agent_completed`
pub async fn events_until_complete(
    rx: &mut broadcast::Receiver<SupervisorEvent>,
) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Wait for a step event with the given agent and status
pub async fn wait_for_step(
    rx: &mut broadcast::Receiver<SupervisorEvent>,
    agent: &str,
    wanted: StepStatus,
) -> SupervisorEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        if let EventKind::Step {
            step_name, status, ..
        } = &event.kind
        {
            if step_name == agent && *status == wanted {
                return event;
            }
        }
    }
}

pub fn count_type(events: &[SupervisorEvent], event_type: &str) -> usize {
    events
        .iter()
        .filter(|event| event.event_type() == event_type)
        .count()
}

/// Terminal step statuses (completed or fallback) per agent, in emission order
pub fn terminal_steps(events: &[SupervisorEvent]) -> Vec<(String, StepStatus)> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::Step {
                step_name, status, ..
            } if matches!(status, StepStatus::Completed | StepStatus::Fallback) => {
                Some((step_name.clone(), *status))
            }
            _ => None,
        })
        .collect()
}
