//! Supervisor engine
//!
//! Runs an [`ExecutionPlan`] for one user request: each agent step executes in
//! a child context under the reliability guard, its result is merged into the
//! parent context, and progress is streamed as [`SupervisorEvent`]s to the
//! requesting connection and to in-process subscribers.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::context::{ExecutionContext, ResultKeyMap};
use crate::events::{self, CompletionStatus, EventBroadcaster, FlowEventRecorder, StepStatus};
use crate::fallback::FallbackStrategyResolver;
use crate::flow::{FlowRegistry, FlowState, RunState, StateSummary};
use crate::metrics;
use crate::plan::{AgentStep, DecisionPoint, ExecutionPlan, PlanStage};
use crate::reliability::{FailureReason, ReliabilityExecutor};
use crate::router::MessageRouter;
use crate::services::{AgentErrorKind, AgentExecutionError, AgentService, ThreadService};
use crate::{Result, SupervisorError};

/// A request to run the supervisor for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub user_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Connection that receives this run's events
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    /// Defaults to [`ExecutionPlan::standard`]
    #[serde(default)]
    pub plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub title: Option<String>,
}

impl RunRequest {
    pub fn new(user_id: impl Into<String>, input: Value) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: None,
            request_id: None,
            connection_id: None,
            input,
            plan: None,
            title: None,
        }
    }

    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Terminal result of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub flow_id: String,
    pub thread_id: Option<String>,
    pub status: CompletionStatus,
    pub error: Option<String>,
    pub metadata: HashMap<String, Value>,
    /// Agents whose result came from a fallback
    pub fallbacks: Vec<String>,
    pub state_summary: StateSummary,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

/// Identity of a run whose flow is registered but whose execution has not
/// produced any event yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStarted {
    pub run_id: String,
    pub flow_id: String,
    pub thread_id: Option<String>,
}

/// Handle to a spawned run
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    flow_id: String,
    context: Arc<RwLock<ExecutionContext>>,
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Current parent context, including results merged so far
    pub async fn context(&self) -> ExecutionContext {
        self.context.read().await.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<RunOutcome> {
        let run_id = self.run_id;
        self.join.await.map_err(|e| {
            SupervisorError::Cancelled(format!("run {} ended abnormally: {}", run_id, e))
        })
    }
}

#[derive(Debug, Clone)]
struct ActiveRun {
    user_id: String,
    flow_id: String,
    cancel: CancellationToken,
}

pub struct SupervisorEngine {
    agents: Arc<dyn AgentService>,
    threads: Arc<dyn ThreadService>,
    router: Arc<MessageRouter>,
    flows: Arc<FlowRegistry>,
    recorder: FlowEventRecorder,
    broadcaster: EventBroadcaster,
    resolver: FallbackStrategyResolver,
    result_keys: ResultKeyMap,
    reliability: ReliabilityExecutor,
    config: SupervisorConfig,
    active_runs: DashMap<String, ActiveRun>,
}

impl SupervisorEngine {
    pub fn new(
        agents: Arc<dyn AgentService>,
        threads: Arc<dyn ThreadService>,
        router: Arc<MessageRouter>,
        flows: Arc<FlowRegistry>,
        config: SupervisorConfig,
    ) -> Self {
        let reliability = router.reliability().clone();
        Self {
            agents,
            threads,
            router,
            recorder: FlowEventRecorder::new(flows.clone()),
            flows,
            broadcaster: EventBroadcaster::new(config.event_channel_capacity),
            resolver: FallbackStrategyResolver::new(),
            result_keys: config.result_key_map(),
            reliability,
            config,
            active_runs: DashMap::new(),
        }
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub fn flows(&self) -> &Arc<FlowRegistry> {
        &self.flows
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn reliability(&self) -> &ReliabilityExecutor {
        &self.reliability
    }

    /// Validate the request, register its flow and spawn the run
    pub async fn start_run(self: &Arc<Self>, request: RunRequest) -> Result<RunHandle> {
        self.start_run_with(request, |_| async {}).await
    }

    /// Like [`SupervisorEngine::start_run`], but `on_start` completes before
    /// the run emits its first event
    pub async fn start_run_with<F, Fut>(
        self: &Arc<Self>,
        request: RunRequest,
        on_start: F,
    ) -> Result<RunHandle>
    where
        F: FnOnce(RunStarted) -> Fut,
        Fut: Future<Output = ()>,
    {
        if request.user_id.trim().is_empty() {
            return Err(SupervisorError::Validation("user_id is required".to_string()));
        }
        let plan = request.plan.clone().unwrap_or_else(ExecutionPlan::standard);
        plan.validate()?;

        let thread_id = match request.thread_id.clone() {
            Some(thread_id) => Some(thread_id),
            None => {
                let title = request
                    .title
                    .clone()
                    .unwrap_or_else(|| "Supervisor run".to_string());
                let created = self
                    .reliability
                    .guard(
                        "create_thread",
                        async {
                            self.threads
                                .create_thread(&title, &json!({ "user_id": request.user_id }))
                                .await
                                .ok_or("no thread returned")
                        },
                        self.config.thread_timeout(),
                    )
                    .await;
                match created {
                    Ok(thread_id) => Some(thread_id),
                    Err(reason) => {
                        tracing::warn!(
                            "[SUPERVISOR] Thread service unavailable ({}), running without a thread for {}",
                            reason,
                            request.user_id
                        );
                        None
                    }
                }
            }
        };

        let mut context = ExecutionContext::new(request.user_id.clone(), thread_id);
        if let Some(request_id) = &request.request_id {
            context = context.with_request_id(request_id.clone());
        }

        let run_id = context.run_id().to_string();
        let flow_id = run_id.replacen("run_", "flow_", 1);
        self.flows.create(FlowState::new(
            flow_id.clone(),
            context.correlation_id(),
            plan.step_count(),
        ))?;

        let cancel = CancellationToken::new();
        self.active_runs.insert(
            run_id.clone(),
            ActiveRun {
                user_id: request.user_id.clone(),
                flow_id: flow_id.clone(),
                cancel: cancel.clone(),
            },
        );
        metrics::set_active_runs(self.active_runs.len());

        let context = Arc::new(RwLock::new(context));
        let scope = RunScope {
            engine: self.clone(),
            run_id: run_id.clone(),
            flow_id: flow_id.clone(),
            parent: context.clone(),
            input: Arc::new(request.input),
            connection_id: request.connection_id.map(Arc::new),
            cancel: cancel.clone(),
            step_counter: Arc::new(AtomicU32::new(0)),
            fallbacks: Arc::new(Mutex::new(Vec::new())),
        };

        tracing::info!(
            "[SUPERVISOR] Starting run {} (flow {}) with {} planned steps",
            run_id,
            flow_id,
            plan.step_count()
        );

        let thread_id = context.read().await.thread_id().map(str::to_string);
        on_start(RunStarted {
            run_id: run_id.clone(),
            flow_id: flow_id.clone(),
            thread_id,
        })
        .await;

        let join = tokio::spawn(async move { scope.drive(plan).await });

        Ok(RunHandle {
            run_id,
            flow_id,
            context,
            cancel,
            join,
        })
    }

    /// Start a run and wait for its outcome
    pub async fn run(self: &Arc<Self>, request: RunRequest) -> Result<RunOutcome> {
        self.start_run(request).await?.wait().await
    }

    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.active_runs.get(run_id) {
            Some(run) => {
                run.cancel.cancel();
                tracing::info!("[SUPERVISOR] Cancellation requested for run {}", run_id);
                true
            }
            None => false,
        }
    }

    /// Cancel every active run owned by `user_id`
    pub fn cancel_user_runs(&self, user_id: &str) -> usize {
        let mut cancelled = 0;
        for run in self.active_runs.iter().filter(|run| run.user_id == user_id) {
            run.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    pub fn run_owner(&self, run_id: &str) -> Option<String> {
        self.active_runs.get(run_id).map(|run| run.user_id.clone())
    }

    pub fn flow_id_for_run(&self, run_id: &str) -> Option<String> {
        self.active_runs.get(run_id).map(|run| run.flow_id.clone())
    }

    pub fn active_run_ids(&self) -> Vec<String> {
        self.active_runs.iter().map(|run| run.key().clone()).collect()
    }

    /// Drop flows idle longer than `idle` that no active run still owns
    pub fn sweep_idle_flows(&self, idle: Duration) -> Vec<String> {
        let live: HashSet<String> = self
            .active_runs
            .iter()
            .map(|run| run.flow_id.clone())
            .collect();
        self.flows.sweep_idle(idle, |flow_id| live.contains(flow_id))
    }
}

/// Everything one run's tasks share. Cheap to clone into branch tasks.
#[derive(Clone)]
struct RunScope {
    engine: Arc<SupervisorEngine>,
    run_id: String,
    flow_id: String,
    parent: Arc<RwLock<ExecutionContext>>,
    input: Arc<Value>,
    connection_id: Option<Arc<String>>,
    cancel: CancellationToken,
    step_counter: Arc<AtomicU32>,
    fallbacks: Arc<Mutex<Vec<String>>>,
}

impl RunScope {
    fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    async fn update<R>(&self, f: impl FnOnce(&mut FlowState) -> Result<R>) -> Result<R> {
        self.engine.flows.update(&self.flow_id, f).await
    }

    /// Build an event against the current flow state and deliver it. Delivery
    /// failures never affect the run.
    async fn emit(&self, build: impl FnOnce(&FlowState) -> events::SupervisorEvent) {
        match self.engine.recorder.record(&self.flow_id, build).await {
            Ok(event) => {
                metrics::record_event(event.event_type());
                if let Some(connection_id) = &self.connection_id {
                    self.engine.router.send_message(connection_id, &event).await;
                }
                self.engine.broadcaster.broadcast(event);
            }
            Err(e) => {
                tracing::warn!("[SUPERVISOR] Dropping event for {}: {}", self.flow_id, e);
            }
        }
    }

    fn cancelled(&self) -> SupervisorError {
        SupervisorError::Cancelled(self.run_id.clone())
    }

    async fn drive(self, plan: ExecutionPlan) -> RunOutcome {
        let started = self
            .update(|state| {
                state.transition(RunState::Running)?;
                state.set_phase("running");
                Ok(())
            })
            .await;

        if started.is_ok() {
            self.emit(|state| events::flow_event(state, "started")).await;
        }

        let result = match started {
            Ok(()) => self.run_stages(&plan.stages).await,
            Err(e) => Err(e),
        };

        let (status, error, next, phase) = match &result {
            Ok(()) => (CompletionStatus::Success, None, RunState::Completed, "completed"),
            Err(e) => (
                CompletionStatus::Error,
                Some(e.to_string()),
                RunState::Failed,
                "failed",
            ),
        };

        if let Err(e) = self
            .update(|state| {
                state.active_agents.clear();
                state.set_phase(phase);
                state.transition(next)
            })
            .await
        {
            tracing::error!("[SUPERVISOR] Could not finalize flow {}: {}", self.flow_id, e);
        }

        self.emit(|state| events::flow_event(state, phase)).await;
        let run_id = self.run_id.clone();
        let completion_error = error.clone();
        self.emit(move |state| events::completion_event(state, &run_id, status, completion_error))
            .await;

        let state_summary = match self.engine.flows.snapshot(&self.flow_id).await {
            Ok(state) => state.summary(),
            Err(_) => StateSummary {
                total_steps: 0,
                completed_steps: 0,
                current_phase: phase.to_string(),
                active_agents: Vec::new(),
            },
        };
        self.engine.flows.remove(&self.flow_id);
        self.engine.active_runs.remove(&self.run_id);
        metrics::set_active_runs(self.engine.active_runs.len());

        let context = self.parent.read().await.clone();
        let fallbacks = self.fallbacks.lock().await.clone();

        match &error {
            None => {
                metrics::record_run("success");
                tracing::info!(
                    "[SUPERVISOR] Run {} completed ({} fallbacks)",
                    self.run_id,
                    fallbacks.len()
                );
            }
            Some(e) => {
                metrics::record_run("error");
                tracing::error!("[SUPERVISOR] Run {} failed: {}", self.run_id, e);
            }
        }

        RunOutcome {
            run_id: self.run_id.clone(),
            flow_id: self.flow_id.clone(),
            thread_id: context.thread_id().map(str::to_string),
            status,
            error,
            metadata: context.metadata().clone(),
            fallbacks,
            state_summary,
        }
    }

    fn run_stages<'a>(&'a self, stages: &'a [PlanStage]) -> BoxFuture<'a, Result<()>> {
        async move {
            for stage in stages {
                if self.cancel.is_cancelled() {
                    return Err(self.cancelled());
                }
                match stage {
                    PlanStage::Sequential { steps } => self.run_sequential(steps).await?,
                    PlanStage::Parallel { steps } => self.run_parallel(steps).await?,
                    PlanStage::Decision { point } => self.run_decision(point).await?,
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn run_sequential(&self, steps: &[AgentStep]) -> Result<()> {
        self.update(|state| {
            state.transition(RunState::SequentialStep)?;
            state.set_phase("sequential");
            Ok(())
        })
        .await?;

        let names: Vec<String> = steps.iter().map(|s| s.agent_name.clone()).collect();
        self.emit(|state| events::sequential_event(state, &names)).await;

        for step in steps {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            self.run_step(step.clone()).await?;
        }
        Ok(())
    }

    async fn run_parallel(&self, steps: &[AgentStep]) -> Result<()> {
        self.update(|state| {
            state.transition(RunState::ParallelFanout)?;
            state.set_phase("parallel_fanout");
            Ok(())
        })
        .await?;

        let names: Vec<String> = steps.iter().map(|s| s.agent_name.clone()).collect();
        self.emit(|state| events::parallel_event(state, &names)).await;

        let stage_cancel = self.cancel.child_token();
        let mut branches = JoinSet::new();
        for step in steps.iter().cloned() {
            let branch = self.with_cancel(stage_cancel.clone());
            branches.spawn(async move {
                let agent_name = step.agent_name.clone();
                let result = branch.run_step(step).await;
                (agent_name, result)
            });
        }

        let mut resolved = Vec::with_capacity(steps.len());
        let mut failure: Option<SupervisorError> = None;
        while let Some(joined) = branches.join_next().await {
            let error = match joined {
                Ok((agent_name, Ok(()))) => {
                    resolved.push(agent_name);
                    continue;
                }
                Ok((agent_name, Err(e))) => {
                    tracing::error!("[SUPERVISOR] Branch {} failed: {}", agent_name, e);
                    e
                }
                Err(e) => SupervisorError::Handler(format!("branch task failed: {}", e)),
            };
            if failure.is_none() {
                stage_cancel.cancel();
                failure = Some(error);
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }

        // completion record, in resolution order
        self.emit(|state| events::sequential_event(state, &resolved)).await;
        Ok(())
    }

    async fn run_decision(&self, point: &DecisionPoint) -> Result<()> {
        self.update(|state| {
            state.transition(RunState::Decision)?;
            state.set_phase(format!("decision:{}", point.name));
            Ok(())
        })
        .await?;

        let metadata = self.parent.read().await.metadata().clone();
        let path = point.choose(&metadata).ok_or_else(|| {
            SupervisorError::Validation(format!("no eligible path for decision '{}'", point.name))
        })?;

        let added = path.step_count();
        self.update(|state| {
            state.add_steps(added);
            Ok(())
        })
        .await?;

        tracing::info!(
            "[SUPERVISOR] Decision {} chose {} for run {}",
            point.name,
            path.name,
            self.run_id
        );
        self.emit(|state| events::decision_event(state, &point.name, &path.name))
            .await;

        self.run_stages(&path.stages).await
    }

    async fn run_step(&self, step: AgentStep) -> Result<()> {
        let agent_name = step.agent_name.clone();
        let result = self.execute_step(&step).await;
        if result.is_err() {
            if let Err(e) = self
                .update(|state| {
                    state.agent_finished(&agent_name);
                    Ok(())
                })
                .await
            {
                tracing::warn!(
                    "[SUPERVISOR] Could not clear {} from flow {}: {}",
                    agent_name,
                    self.flow_id,
                    e
                );
            }
        }
        result
    }

    async fn execute_step(&self, step: &AgentStep) -> Result<()> {
        let engine = &self.engine;
        let agent = step.agent_name.as_str();
        let step_number = self.step_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();

        self.update(|state| {
            state.agent_started(agent);
            state.set_phase(agent);
            Ok(())
        })
        .await?;
        self.emit(|state| events::step_event(state, agent, step_number, StepStatus::Started))
            .await;

        let (child, config) = {
            let parent = self.parent.read().await;
            let child = parent.child(agent);
            let config = agent_config(step, &child, parent.metadata());
            (child, config)
        };
        let input = step.input.clone().unwrap_or_else(|| (*self.input).clone());
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| engine.config.step_timeout());
        let max_attempts = step
            .max_attempts
            .unwrap_or(engine.config.max_attempts)
            .max(1);

        let mut last_failure: Option<FailureReason> = None;
        let mut response: Option<Value> = None;

        for attempt in 1..=max_attempts {
            if let Some(reason) = &last_failure {
                let reason = reason.to_string();
                self.update(|state| {
                    state.set_phase(format!("retry:{}", agent));
                    Ok(())
                })
                .await?;
                metrics::record_retry(agent);
                self.emit(|state| events::retry_event(state, agent, attempt, &reason))
                    .await;
            }

            let mut agent_error: Option<AgentExecutionError> = None;
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                outcome = engine.reliability.guard(
                    agent,
                    async {
                        engine
                            .agents
                            .execute_agent(agent, child.thread_id(), &input, &config)
                            .await
                            .map_err(|e| {
                                let message = e.message.clone();
                                agent_error = Some(e);
                                message
                            })
                    },
                    timeout,
                ) => outcome,
            };

            match outcome {
                Ok(agent_response) => {
                    tracing::debug!(
                        "[SUPERVISOR] {} finished agent run {}",
                        agent,
                        agent_response.run_id
                    );
                    response = Some(agent_response.response);
                    break;
                }
                Err(reason) => {
                    let terminal = agent_error.as_ref().is_some_and(|e| e.is_terminal())
                        || !engine.resolver.is_recoverable(&reason);
                    if terminal {
                        let error = agent_error
                            .unwrap_or_else(|| AgentExecutionError::terminal(agent, reason.to_string()));
                        tracing::error!(
                            "[SUPERVISOR] {} hit a terminal error on attempt {}: {}",
                            agent,
                            attempt,
                            error
                        );
                        return Err(self.fail_step(agent, step_number, started, error).await);
                    }
                    tracing::warn!(
                        "[SUPERVISOR] {} attempt {}/{} failed: {}",
                        agent,
                        attempt,
                        max_attempts,
                        reason
                    );
                    last_failure = Some(reason);
                }
            }
        }

        let (value, status) = match (response, last_failure) {
            (Some(value), _) => (value, StepStatus::Completed),
            (None, Some(reason)) => {
                let metadata = self.parent.read().await.metadata().clone();
                match engine.resolver.resolve(agent, &input, &metadata, &reason) {
                    Some(fallback) => {
                        let cause = reason.to_string();
                        self.update(|state| {
                            state.set_phase(format!("fallback:{}", agent));
                            Ok(())
                        })
                        .await?;
                        self.emit(|state| {
                            events::fallback_event(state, agent, &fallback.strategy, &cause)
                        })
                        .await;
                        self.fallbacks.lock().await.push(agent.to_string());
                        (fallback.value, StepStatus::Fallback)
                    }
                    None => {
                        let error = AgentExecutionError {
                            agent_name: agent.to_string(),
                            message: format!("{} and no fallback is available", reason),
                            kind: AgentErrorKind::Recoverable,
                        };
                        return Err(self.fail_step(agent, step_number, started, error).await);
                    }
                }
            }
            (None, None) => {
                return Err(SupervisorError::Validation(format!(
                    "agent '{}' produced no outcome",
                    agent
                )))
            }
        };

        let mut child = child;
        record_agent_result(&engine.result_keys, &mut child, agent, value);
        {
            let mut parent = self.parent.write().await;
            engine.result_keys.merge_child_result(&mut parent, &child, agent);
        }

        self.update(|state| {
            state.complete_step()?;
            state.agent_finished(agent);
            Ok(())
        })
        .await?;
        self.emit(|state| events::step_event(state, agent, step_number, status))
            .await;

        let outcome = match status {
            StepStatus::Fallback => "fallback",
            _ => "success",
        };
        metrics::record_step(agent, outcome, started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn fail_step(
        &self,
        agent: &str,
        step_number: u32,
        started: Instant,
        error: AgentExecutionError,
    ) -> SupervisorError {
        self.emit(|state| events::step_event(state, agent, step_number, StepStatus::Failed))
            .await;
        metrics::record_step(agent, "failed", started.elapsed().as_secs_f64());
        SupervisorError::AgentExecution(error)
    }
}

/// Step config plus the run identity and the results gathered so far
fn agent_config(
    step: &AgentStep,
    child: &ExecutionContext,
    results: &HashMap<String, Value>,
) -> Value {
    let mut config = match &step.config {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("settings".to_string(), other.clone());
            map
        }
    };
    config.insert("run_id".to_string(), json!(child.run_id()));
    config.insert("user_id".to_string(), json!(child.user_id()));
    config.insert("request_id".to_string(), json!(child.request_id()));
    config.insert("correlation_id".to_string(), json!(child.correlation_id()));
    config.insert(
        "prior_results".to_string(),
        Value::Object(results.clone().into_iter().collect()),
    );
    Value::Object(config)
}

/// Store an agent's output on its child context under the declared keys. An
/// object response that carries a declared key supplies that key directly;
/// otherwise the whole response goes under the primary key.
fn record_agent_result(
    keys: &ResultKeyMap,
    child: &mut ExecutionContext,
    agent: &str,
    value: Value,
) {
    let declared = keys.keys_for(agent).to_vec();
    if declared.is_empty() {
        tracing::warn!(
            "[SUPERVISOR] Agent {} has no declared result keys; its output is not merged",
            agent
        );
        return;
    }

    for key in declared.iter().skip(1) {
        if let Some(part) = value.get(key) {
            child.record_result(key.clone(), part.clone());
        }
    }
    let primary = &declared[0];
    let primary_value = value.get(primary).cloned().unwrap_or(value);
    child.record_result(primary.clone(), primary_value);
}
