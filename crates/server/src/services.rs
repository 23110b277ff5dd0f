//! HTTP-backed collaborator services

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use supervisor::{AgentExecutionError, AgentResponse, AgentService, ThreadService};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn build_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("[SERVICES] Falling back to default HTTP client: {}", e);
            Client::new()
        })
}

/// Executes sub-agents through `POST {base}/agents/{name}/execute`
#[derive(Debug, Clone)]
pub struct HttpAgentService {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpAgentService {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-success status from the agent service to an execution error.
/// Auth failures are terminal; everything else may be retried.
fn status_error(agent_name: &str, status: StatusCode, body: &str) -> AgentExecutionError {
    match status {
        StatusCode::UNAUTHORIZED => AgentExecutionError::terminal(
            agent_name,
            format!("authentication failed calling agent service: {}", body),
        ),
        StatusCode::FORBIDDEN => AgentExecutionError::terminal(
            agent_name,
            format!("authorization denied by agent service: {}", body),
        ),
        _ => AgentExecutionError::new(
            agent_name,
            format!("agent service returned {}: {}", status, body),
        ),
    }
}

#[async_trait]
impl AgentService for HttpAgentService {
    async fn execute_agent(
        &self,
        agent_name: &str,
        thread_id: Option<&str>,
        input: &Value,
        config: &Value,
    ) -> Result<AgentResponse, AgentExecutionError> {
        let url = format!("{}/agents/{}/execute", self.base_url, agent_name);
        let body = json!({
            "thread_id": thread_id,
            "input": input,
            "config": config,
        });

        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| {
                AgentExecutionError::new(agent_name, format!("agent request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(agent_name, status, &text));
        }

        response.json::<AgentResponse>().await.map_err(|e| {
            AgentExecutionError::new(agent_name, format!("invalid agent response: {}", e))
        })
    }
}

#[derive(Debug, Deserialize)]
struct CreatedThread {
    thread_id: String,
}

/// Creates conversation threads through `POST {base}/threads`
#[derive(Debug, Clone)]
pub struct HttpThreadService {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpThreadService {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl ThreadService for HttpThreadService {
    async fn create_thread(&self, title: &str, metadata: &Value) -> Option<String> {
        let mut request = self
            .client
            .post(format!("{}/threads", self.base_url))
            .json(&json!({ "title": title, "metadata": metadata }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!(
                    "[SERVICES] Thread service returned {}",
                    response.status()
                );
                return None;
            }
            Err(e) => {
                tracing::warn!("[SERVICES] Thread service unreachable: {}", e);
                return None;
            }
        };

        match response.json::<CreatedThread>().await {
            Ok(created) => Some(created.thread_id),
            Err(e) => {
                tracing::warn!("[SERVICES] Invalid thread service response: {}", e);
                None
            }
        }
    }
}
