use std::sync::Arc;

use supervisor::{
    AgentService, AlertMonitor, ConnectionManager, FlowRegistry, InMemoryThreadService,
    MessageRouter, ReliabilityExecutor, SupervisorEngine, ThreadService, metrics,
};

use crate::{
    config::ServerConfig,
    handlers,
    services::{HttpAgentService, HttpThreadService},
};

/// Shared state handed to every route
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SupervisorEngine>,
    pub connections: Arc<ConnectionManager>,
    pub monitor: Arc<AlertMonitor>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the supervisor with the given collaborators and register its
    /// message handlers
    pub fn new(
        config: ServerConfig,
        agents: Arc<dyn AgentService>,
        threads: Arc<dyn ThreadService>,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let router = Arc::new(MessageRouter::new(
            connections.clone(),
            ReliabilityExecutor::new(),
            config.supervisor.send_timeout(),
        ));
        let flows = Arc::new(FlowRegistry::new());
        let monitor = Arc::new(AlertMonitor::new(config.supervisor.alert_thresholds.clone()));
        let engine = Arc::new(SupervisorEngine::new(
            agents,
            threads,
            router,
            flows,
            config.supervisor.clone(),
        ));
        handlers::register_handlers(&engine);

        Self {
            engine,
            connections,
            monitor,
            config: Arc::new(config),
        }
    }

    /// Collaborators built from the configured service URLs
    pub fn from_config(config: ServerConfig) -> Self {
        let agents: Arc<dyn AgentService> = Arc::new(HttpAgentService::new(
            config.agent_service_url.clone(),
            config.service_token.clone(),
        ));
        let threads: Arc<dyn ThreadService> = match &config.thread_service_url {
            Some(url) => Arc::new(HttpThreadService::new(
                url.clone(),
                config.service_token.clone(),
            )),
            None => {
                tracing::info!("[SERVER] No THREAD_SERVICE_URL set, keeping threads in memory");
                Arc::new(InMemoryThreadService::new())
            }
        };
        Self::new(config, agents, threads)
    }

    /// One lifecycle pass: drop expired connections and abandoned flows,
    /// evaluate alert thresholds, sweep old alerts
    pub async fn heartbeat(&self) {
        let supervisor = &self.config.supervisor;

        let expired = self
            .connections
            .sweep_expired(supervisor.connection_timeout());
        if !expired.is_empty() {
            tracing::info!("[HEARTBEAT] Removed {} expired connections", expired.len());
        }

        let abandoned = self.engine.sweep_idle_flows(supervisor.flow_idle_ttl());
        if !abandoned.is_empty() {
            tracing::warn!("[HEARTBEAT] Dropped {} idle flows", abandoned.len());
        }

        for (metric_name, value) in [
            ("send_failure_rate", metrics::send_failure_rate()),
            ("run_failure_rate", metrics::run_failure_rate()),
            ("active_connections", self.connections.stats().alive_connections as f64),
        ] {
            let crossed = self
                .monitor
                .thresholds()
                .iter()
                .any(|t| t.metric_name == metric_name && t.classify(value).is_some());
            if crossed {
                self.monitor.evaluate(metric_name, value).await;
            } else {
                self.monitor.resolve(metric_name).await;
            }
        }

        let swept = self.monitor.sweep(supervisor.alert_retention()).await;
        if swept > 0 {
            tracing::debug!("[HEARTBEAT] Swept {} alerts", swept);
        }
    }
}
