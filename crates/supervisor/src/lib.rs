//! # Supervisor
//!
//! Drives multi-step AI tasks by running independently-failing sub-agents under a
//! coordinating supervisor, and turns their progress into an ordered stream of
//! events delivered over live client connections.

pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod events;
pub mod fallback;
pub mod flow;
pub mod metrics;
pub mod monitor;
pub mod plan;
pub mod reliability;
pub mod router;
pub mod services;

#[cfg(test)]
mod router_tests;
#[cfg(test)]
mod test_support;

pub use config::SupervisorConfig;
pub use connection::{
    ChannelTransport, ConnectionInfo, ConnectionManager, ConnectionStats, Transport,
    TransportError,
};
pub use context::{merge_child_result, ExecutionContext, ResultKeyMap};
pub use engine::{RunHandle, RunOutcome, RunRequest, RunStarted, SupervisorEngine};
pub use events::{
    CompletionStatus, EventBroadcaster, EventKind, FlowEventRecorder, StepStatus,
    SupervisorEvent,
};
pub use fallback::{EntityExtraction, FallbackOutcome, FallbackStrategyResolver, IntentMatch};
pub use flow::{FlowRegistry, FlowState, RunState, StateSummary};
pub use monitor::{Alert, AlertMonitor, AlertSeverity, AlertThreshold};
pub use plan::{AgentStep, DecisionPath, DecisionPoint, ExecutionPlan, PlanStage};
pub use reliability::{FailureReason, Recovered, ReliabilityExecutor};
pub use router::{handler_fn, MessageContext, MessageHandler, MessageRouter, MessageType};
pub use services::{
    AgentExecutionError, AgentErrorKind, AgentResponse, AgentService, InMemoryThreadService,
    ThreadService,
};

/// Main error type for supervisor operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Connection is no longer alive: {0}")]
    ConnectionDead(String),

    #[error("Send to {connection_id} timed out after {timeout_ms}ms")]
    SendTimeout {
        connection_id: String,
        timeout_ms: u64,
    },

    #[error(transparent)]
    AgentExecution(#[from] AgentExecutionError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
