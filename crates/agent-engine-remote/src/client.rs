//! Agent engine HTTP client.

use agent_engine_core::{FragmentStream, RemoteAgent, RemoteError, SessionSnapshot, UserId};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use crate::{
    config::EngineConfig,
    protocol::{self, EngineResource, LineBuffer, QueryRequest, QueryResponse},
};

/// `RemoteAgent` backed by the agent engine REST API.
///
/// Holds no session state; clone the surrounding `Arc` to share it between
/// controllers.
#[derive(Debug, Clone)]
pub struct AgentEngineClient {
    http: reqwest::Client,
    config: EngineConfig,
    display_name: String,
}

impl AgentEngineClient {
    /// Build a client and verify the resource exists.
    ///
    /// # Errors
    /// Returns [`RemoteError::NotFound`] for an unknown resource and
    /// [`RemoteError::Connection`] if the service cannot be reached.
    pub async fn connect(config: EngineConfig) -> Result<Self, RemoteError> {
        let mut client = Self::new(config)?;

        debug!(resource = %client.config.resource_name, "Fetching agent engine resource");
        let mut request = client.http.get(client.config.resource_url());
        if let Some(token) = &client.config.access_token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await.map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let resource: EngineResource = resp
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        if let Some(name) = resource.display_name.filter(|n| !n.is_empty()) {
            client.display_name = name;
        }
        info!(resource = %resource.name, display_name = %client.display_name, "Connected to agent engine");
        Ok(client)
    }

    /// Build a client without contacting the service.
    ///
    /// # Errors
    /// Returns [`RemoteError::Connection`] if the HTTP client cannot be built.
    pub fn new(config: EngineConfig) -> Result<Self, RemoteError> {
        let mut builder = reqwest::Client::builder().pool_max_idle_per_host(10);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| RemoteError::Connection(e.to_string()))?;
        let display_name = config
            .resource_name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            http,
            config,
            display_name,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn post(&self, url: String, body: &QueryRequest) -> reqwest::RequestBuilder {
        let request = self.http.post(url).json(body);
        match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn query(&self, body: &QueryRequest) -> Result<SessionSnapshot, RemoteError> {
        debug!(class_method = %body.class_method, "Agent engine query");
        let resp = self
            .post(self.config.query_url(), body)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let response: QueryResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        response.into_snapshot()
    }
}

#[async_trait]
impl RemoteAgent for AgentEngineClient {
    async fn create_session(&self, user_id: &UserId) -> Result<SessionSnapshot, RemoteError> {
        self.query(&QueryRequest::create_session(user_id.as_str()))
            .await
    }

    async fn get_session(
        &self,
        session_id: &str,
        user_id: &UserId,
    ) -> Result<SessionSnapshot, RemoteError> {
        self.query(&QueryRequest::get_session(session_id, user_id.as_str()))
            .await
    }

    async fn stream_query(
        &self,
        user_id: &UserId,
        session_id: &str,
        message: &str,
    ) -> Result<FragmentStream, RemoteError> {
        let body = QueryRequest::stream_query(user_id.as_str(), session_id, message);
        debug!(session_id, "Agent engine stream query");

        let resp = self
            .post(self.config.stream_query_url(), &body)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            futures::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(transport_error(e));
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    if let Some(fragment) = protocol::decode_line(&line) {
                        yield Ok(fragment);
                    }
                }
            }

            if let Some(fragment) = lines.finish().as_deref().and_then(protocol::decode_line) {
                yield Ok(fragment);
            }
        };

        Ok(Box::pin(stream))
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn resource_name(&self) -> &str {
        &self.config.resource_name
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(err.to_string())
    } else if err.is_connect() {
        RemoteError::Connection(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_to_error(status.as_u16(), body))
}

fn status_to_error(status: u16, body: String) -> RemoteError {
    match status {
        404 => RemoteError::NotFound(body),
        _ => RemoteError::Api {
            status,
            message: body,
        },
    }
}
