//! Inbound dispatch and guarded outbound delivery

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::ConnectionManager;
use crate::metrics;
use crate::reliability::ReliabilityExecutor;
use crate::{Result, SupervisorError};

/// Inbound message tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    StartAgent,
    UserMessage,
    StopAgent,
    Ping,
    GetFlowState,
    Unknown(String),
}

impl MessageType {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "start_agent" => MessageType::StartAgent,
            "user_message" => MessageType::UserMessage,
            "stop_agent" => MessageType::StopAgent,
            "ping" => MessageType::Ping,
            "get_flow_state" => MessageType::GetFlowState,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageType::StartAgent => "start_agent",
            MessageType::UserMessage => "user_message",
            MessageType::StopAgent => "stop_agent",
            MessageType::Ping => "ping",
            MessageType::GetFlowState => "get_flow_state",
            MessageType::Unknown(tag) => tag,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    payload: Value,
}

/// Everything a handler knows about the message it is handling
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub connection_id: String,
    pub user_id: String,
    pub message_type: MessageType,
    pub payload: Value,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: MessageContext) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, ctx: MessageContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

pub struct MessageRouter {
    connections: Arc<ConnectionManager>,
    reliability: ReliabilityExecutor,
    handlers: DashMap<MessageType, Arc<dyn MessageHandler>>,
    fallback: RwLock<Option<Arc<dyn MessageHandler>>>,
    send_timeout: Duration,
}

impl MessageRouter {
    pub fn new(
        connections: Arc<ConnectionManager>,
        reliability: ReliabilityExecutor,
        send_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            reliability,
            handlers: DashMap::new(),
            fallback: RwLock::new(None),
            send_timeout,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Executor guarding outbound sends; the engine shares its counters
    pub fn reliability(&self) -> &ReliabilityExecutor {
        &self.reliability
    }

    /// One handler per type; a later registration replaces the earlier one
    pub fn register_message_handler(
        &self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) {
        if self.handlers.insert(message_type.clone(), handler).is_some() {
            tracing::debug!("[ROUTER] Replaced handler for {}", message_type.as_str());
        }
    }

    pub fn register_fallback_handler(&self, handler: Arc<dyn MessageHandler>) {
        let mut slot = self
            .fallback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handler);
    }

    fn handler_for(&self, message_type: &MessageType) -> Option<Arc<dyn MessageHandler>> {
        if let Some(handler) = self.handlers.get(message_type) {
            return Some(handler.value().clone());
        }
        self.fallback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Validate, parse and dispatch one raw inbound message.
    /// Returns `true` when a handler ran and succeeded.
    pub async fn handle_message(&self, connection_id: &str, raw: &str) -> bool {
        let user_id = match self.connections.begin_receive(connection_id) {
            Ok(user_id) => user_id,
            Err(e) => {
                tracing::warn!("[ROUTER] Rejected message: {}", e);
                return false;
            }
        };

        let inbound: InboundMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("[ROUTER] Malformed message from {}: {}", connection_id, e);
                self.send_error(connection_id, "invalid_message", &e.to_string())
                    .await;
                return false;
            }
        };

        let message_type = MessageType::parse(&inbound.message_type);
        let Some(handler) = self.handler_for(&message_type) else {
            tracing::warn!(
                "[ROUTER] No handler for '{}' from {}",
                message_type.as_str(),
                connection_id
            );
            return false;
        };

        let ctx = MessageContext {
            connection_id: connection_id.to_string(),
            user_id,
            message_type: message_type.clone(),
            payload: inbound.payload,
        };

        match handler.handle(ctx).await {
            Ok(()) => {
                self.connections.refresh_deadline(connection_id);
                true
            }
            Err(e) => {
                tracing::error!(
                    "[ROUTER] Handler for '{}' failed: {}",
                    message_type.as_str(),
                    e
                );
                self.send_error(connection_id, "handler_error", &e.to_string())
                    .await;
                false
            }
        }
    }

    /// Serialize and write to one connection under the send timeout. Never
    /// removes the connection; failures are left to the lifecycle sweep.
    pub async fn send_message<M: Serialize + ?Sized>(
        &self,
        connection_id: &str,
        message: &M,
    ) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("[ROUTER] Failed to serialize outbound message: {}", e);
                return false;
            }
        };
        self.send_text(connection_id, text).await
    }

    async fn send_text(&self, connection_id: &str, text: String) -> bool {
        let transport = match self.connections.transport(connection_id) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::debug!("[ROUTER] Skipping send: {}", e);
                metrics::record_send("skipped");
                return false;
            }
        };

        let outcome = self
            .reliability
            .guard(
                &format!("send:{}", connection_id),
                transport.send_text(text),
                self.send_timeout,
            )
            .await;

        match outcome {
            Ok(()) => {
                self.connections.record_sent(connection_id);
                metrics::record_send("success");
                true
            }
            Err(reason) if reason.is_timeout() => {
                let err = SupervisorError::SendTimeout {
                    connection_id: connection_id.to_string(),
                    timeout_ms: self.send_timeout.as_millis() as u64,
                };
                tracing::warn!("[ROUTER] {}", err);
                metrics::record_send("timeout");
                false
            }
            Err(reason) => {
                tracing::warn!("[ROUTER] Send to {} failed: {}", connection_id, reason);
                metrics::record_send("failure");
                false
            }
        }
    }

    /// Send to every alive connection, optionally only one user's. Returns
    /// the number of successful deliveries.
    pub async fn broadcast_message<M: Serialize + ?Sized>(
        &self,
        message: &M,
        user_filter: Option<&str>,
    ) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("[ROUTER] Failed to serialize broadcast: {}", e);
                return 0;
            }
        };

        let targets = self.connections.connection_ids(user_filter);
        let sends = targets
            .iter()
            .map(|connection_id| self.send_text(connection_id, text.clone()));

        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    pub async fn send_error(&self, connection_id: &str, code: &str, message: &str) -> bool {
        let error = json!({
            "type": "error",
            "payload": { "code": code, "message": message },
        });
        self.send_message(connection_id, &error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_parse() {
        assert_eq!(MessageType::parse("start_agent"), MessageType::StartAgent);
        assert_eq!(MessageType::parse("ping"), MessageType::Ping);
        assert_eq!(
            MessageType::parse("dance"),
            MessageType::Unknown("dance".to_string())
        );
        assert_eq!(MessageType::parse("get_flow_state").as_str(), "get_flow_state");
    }
}
