//! Inbound WebSocket message handlers
//!
//! One handler serves the five known message types and is registered for each
//! of them; anything else goes to the fallback, which reports the unknown type
//! back to the sender.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use supervisor::{
    ExecutionPlan, MessageContext, MessageHandler, MessageRouter, MessageType, RunRequest,
    SupervisorEngine, SupervisorError, handler_fn,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartAgentPayload {
    input: Option<Value>,
    message: Option<String>,
    thread_id: Option<String>,
    request_id: Option<String>,
    title: Option<String>,
    plan: Option<ExecutionPlan>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UserMessagePayload {
    message: String,
    thread_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StopAgentPayload {
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FlowStatePayload {
    flow_id: Option<String>,
    run_id: Option<String>,
}

fn parse_payload<T>(message_type: &MessageType, payload: Value) -> supervisor::Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload).map_err(|e| {
        SupervisorError::Validation(format!(
            "invalid {} payload: {}",
            message_type.as_str(),
            e
        ))
    })
}

/// Handler for the known message types. Holds the engine weakly since the
/// engine's router owns this handler.
pub struct SupervisorMessageHandler {
    engine: Weak<SupervisorEngine>,
}

impl SupervisorMessageHandler {
    pub fn new(engine: &Arc<SupervisorEngine>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
        }
    }

    fn engine(&self) -> supervisor::Result<Arc<SupervisorEngine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| SupervisorError::Cancelled("supervisor is shutting down".to_string()))
    }

    async fn start_run(
        &self,
        engine: Arc<SupervisorEngine>,
        ctx: &MessageContext,
        request: RunRequest,
    ) -> supervisor::Result<()> {
        let router = engine.router().clone();
        let connection_id = ctx.connection_id.clone();
        // acknowledged before the run emits its first event
        let handle = engine
            .start_run_with(request, |started| async move {
                router
                    .send_message(
                        &connection_id,
                        &json!({ "type": "agent_started", "payload": started }),
                    )
                    .await;
            })
            .await?;

        tokio::spawn(async move {
            match handle.wait().await {
                Ok(outcome) if !outcome.is_success() => {
                    tracing::info!(
                        "[HANDLERS] Run {} finished with error: {}",
                        outcome.run_id,
                        outcome.error.unwrap_or_default()
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("[HANDLERS] Run ended abnormally: {}", e),
            }
        });
        Ok(())
    }

    async fn start_agent(&self, ctx: MessageContext) -> supervisor::Result<()> {
        let engine = self.engine()?;
        let payload: StartAgentPayload = parse_payload(&ctx.message_type, ctx.payload.clone())?;

        let input = match (payload.input, payload.message) {
            (Some(input), _) => input,
            (None, Some(message)) => json!({ "message": message }),
            (None, None) => {
                return Err(SupervisorError::Validation(
                    "start_agent requires input or message".to_string(),
                ));
            }
        };

        let mut request =
            RunRequest::new(ctx.user_id.clone(), input).with_connection(ctx.connection_id.clone());
        if let Some(thread_id) = payload.thread_id {
            request = request.with_thread(thread_id);
        }
        if let Some(request_id) = payload.request_id {
            request = request.with_request_id(request_id);
        }
        if let Some(plan) = payload.plan {
            request = request.with_plan(plan);
        }
        request.title = payload.title;

        self.start_run(engine, &ctx, request).await
    }

    async fn user_message(&self, ctx: MessageContext) -> supervisor::Result<()> {
        let engine = self.engine()?;
        let payload: UserMessagePayload = parse_payload(&ctx.message_type, ctx.payload.clone())?;
        if payload.message.trim().is_empty() {
            return Err(SupervisorError::Validation(
                "user_message requires a message".to_string(),
            ));
        }

        let mut request = RunRequest::new(
            ctx.user_id.clone(),
            json!({ "message": payload.message }),
        )
        .with_connection(ctx.connection_id.clone());
        if let Some(thread_id) = payload.thread_id {
            request = request.with_thread(thread_id);
        }

        self.start_run(engine, &ctx, request).await
    }

    async fn stop_agent(&self, ctx: MessageContext) -> supervisor::Result<()> {
        let engine = self.engine()?;
        let payload: StopAgentPayload = parse_payload(&ctx.message_type, ctx.payload.clone())?;

        let reply = match payload.run_id {
            Some(run_id) => {
                // runs of other users look the same as missing ones
                if engine.run_owner(&run_id).as_deref() != Some(ctx.user_id.as_str()) {
                    return Err(SupervisorError::Validation(format!(
                        "no active run {}",
                        run_id
                    )));
                }
                let stopped = engine.cancel_run(&run_id);
                json!({ "run_id": run_id, "stopped": stopped })
            }
            None => {
                let stopped = engine.cancel_user_runs(&ctx.user_id);
                json!({ "stopped_runs": stopped })
            }
        };

        engine
            .router()
            .send_message(
                &ctx.connection_id,
                &json!({ "type": "agent_stopped", "payload": reply }),
            )
            .await;
        Ok(())
    }

    async fn ping(&self, ctx: MessageContext) -> supervisor::Result<()> {
        let engine = self.engine()?;
        engine
            .router()
            .send_message(
                &ctx.connection_id,
                &json!({ "type": "pong", "payload": { "timestamp": Utc::now() } }),
            )
            .await;
        Ok(())
    }

    async fn get_flow_state(&self, ctx: MessageContext) -> supervisor::Result<()> {
        let engine = self.engine()?;
        let payload: FlowStatePayload = parse_payload(&ctx.message_type, ctx.payload.clone())?;

        let flow_id = match (payload.flow_id, payload.run_id) {
            (Some(flow_id), _) => flow_id,
            (None, Some(run_id)) => engine
                .flow_id_for_run(&run_id)
                .ok_or_else(|| SupervisorError::FlowNotFound(run_id.clone()))?,
            (None, None) => {
                return Err(SupervisorError::Validation(
                    "get_flow_state requires flow_id or run_id".to_string(),
                ));
            }
        };

        let state = engine.flows().snapshot(&flow_id).await?;
        engine
            .router()
            .send_message(
                &ctx.connection_id,
                &json!({ "type": "flow_state", "payload": state }),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for SupervisorMessageHandler {
    async fn handle(&self, ctx: MessageContext) -> supervisor::Result<()> {
        match ctx.message_type.clone() {
            MessageType::StartAgent => self.start_agent(ctx).await,
            MessageType::UserMessage => self.user_message(ctx).await,
            MessageType::StopAgent => self.stop_agent(ctx).await,
            MessageType::Ping => self.ping(ctx).await,
            MessageType::GetFlowState => self.get_flow_state(ctx).await,
            MessageType::Unknown(tag) => Err(SupervisorError::Handler(format!(
                "no handler for message type {}",
                tag
            ))),
        }
    }
}

/// Register the supervisor's handlers on its own router
pub fn register_handlers(engine: &Arc<SupervisorEngine>) {
    let router = engine.router().clone();
    let handler: Arc<dyn MessageHandler> = Arc::new(SupervisorMessageHandler::new(engine));
    for message_type in [
        MessageType::StartAgent,
        MessageType::UserMessage,
        MessageType::StopAgent,
        MessageType::Ping,
        MessageType::GetFlowState,
    ] {
        router.register_message_handler(message_type, handler.clone());
    }

    let weak_router: Weak<MessageRouter> = Arc::downgrade(&router);
    router.register_fallback_handler(handler_fn(move |ctx| {
        let router = weak_router.clone();
        async move {
            tracing::debug!(
                "[HANDLERS] Unknown message type {} from {}",
                ctx.message_type.as_str(),
                ctx.connection_id
            );
            if let Some(router) = router.upgrade() {
                router
                    .send_error(
                        &ctx.connection_id,
                        "unknown_message_type",
                        &format!("unknown message type: {}", ctx.message_type.as_str()),
                    )
                    .await;
            }
            Ok(())
        }
    }));

    tracing::info!("[HANDLERS] Registered supervisor message handlers");
}
