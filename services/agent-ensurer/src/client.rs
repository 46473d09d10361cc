//! CI server REST client.
//!
//! Provides the two halves of the ensurer that talk to the server:
//! - State fetching (agents, cloud instances)
//! - Instance launching
//!
//! The reconciler only sees the [`ServerApi`] trait, so tests can swap in
//! a scripted server.

use async_trait::async_trait;
use ensurer_reconcile::{Agent, CloudInstance, MalformedAgentError};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{ConfigError, EnsurerError, RemoteError};

/// Fields the classifier needs; nothing else is requested.
pub const AGENT_FIELDS: &str = "agent(id,name,connected,enabled,idleSinceTime,lastActivityTime)";

/// Operations the reconciler needs from the server.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Connectivity and credentials check.
    async fn probe(&self) -> Result<(), RemoteError>;

    /// Fetch every agent with the fields needed for classification.
    async fn fetch_agents(&self) -> Result<Vec<Agent>, EnsurerError>;

    /// Fetch every cloud instance.
    async fn fetch_cloud_instances(&self) -> Result<Vec<CloudInstance>, RemoteError>;

    /// Request one new instance from a cloud profile.
    async fn launch_instance(&self, cloud_profile_id: &str) -> Result<InstanceHandle, RemoteError>;
}

/// What the server answered to a launch request.
///
/// The server does not always describe the new instance, so every field
/// is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InstanceHandle {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub state: Option<String>,
}

/// Body of a launch request.
#[derive(Debug, Serialize)]
pub struct LaunchRequest {
    pub image: ImageRef,
}

#[derive(Debug, Serialize)]
pub struct ImageRef {
    pub id: String,
}

impl LaunchRequest {
    /// Launch request templated on a cloud profile.
    pub fn for_profile(cloud_profile_id: &str) -> Self {
        Self {
            image: ImageRef {
                id: format!("profileId:{cloud_profile_id}"),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentList {
    #[serde(default)]
    agent: Vec<Agent>,
}

#[derive(Debug, Deserialize)]
struct CloudInstanceList {
    #[serde(default, rename = "cloudInstance")]
    cloud_instance: Vec<CloudInstance>,
}

/// HTTP implementation of [`ServerApi`].
///
/// The underlying client keeps no cookie store. Every request, launches in
/// particular, goes out without cookies; only the connection pool and the
/// default headers are shared between calls.
#[derive(Debug, Clone)]
pub struct ServerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    /// Create a client from validated configuration.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.auth_token))
            .map_err(|_| ConfigError::InvalidToken)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    /// Build a URL for a REST path relative to the base URL.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and turn anything but 2xx into [`RemoteError::Status`].
    async fn send(
        &self,
        method: Method,
        url: &str,
        request: RequestBuilder,
    ) -> Result<Response, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|source| RemoteError::Transport {
                method: method.clone(),
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(method = %method, url = %url, status = %status, body = %body, "Request failed");
            return Err(RemoteError::Status {
                method,
                url: url.to_string(),
                status,
                body,
            });
        }

        Ok(response)
    }

    /// Read a success body as text.
    async fn body(
        &self,
        method: Method,
        url: &str,
        response: Response,
    ) -> Result<String, RemoteError> {
        response
            .text()
            .await
            .map_err(|source| RemoteError::Transport {
                method,
                url: url.to_string(),
                source,
            })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RemoteError> {
        let response = self.send(Method::GET, url, self.client.get(url)).await?;
        let body = self.body(Method::GET, url, response).await?;
        serde_json::from_str(&body).map_err(|source| RemoteError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// A request context for one launch call.
    ///
    /// Built from scratch on every call so no state from earlier requests
    /// (notably session cookies, which trip the server's CSRF check) is
    /// carried along.
    fn launch_request(&self, url: &str, body: &LaunchRequest) -> RequestBuilder {
        self.client.post(url).json(body)
    }
}

#[async_trait]
impl ServerApi for ServerClient {
    async fn probe(&self) -> Result<(), RemoteError> {
        let url = self.url("app/rest/server");
        debug!(url = %url, "Probing server");

        self.send(Method::GET, &url, self.client.get(&url)).await?;
        Ok(())
    }

    async fn fetch_agents(&self) -> Result<Vec<Agent>, EnsurerError> {
        let url = self.url("app/rest/agents");
        debug!(url = %url, "Fetching agents");

        let request = self.client.get(&url).query(&[("fields", AGENT_FIELDS)]);
        let response = self.send(Method::GET, &url, request).await?;
        let body = self.body(Method::GET, &url, response).await?;

        let list: AgentList = serde_json::from_str(&body)
            .map_err(|e| MalformedAgentError::Payload(e.to_string()))?;
        debug!(agent_count = list.agent.len(), "Fetched agents");

        Ok(list.agent)
    }

    async fn fetch_cloud_instances(&self) -> Result<Vec<CloudInstance>, RemoteError> {
        let url = self.url("app/rest/cloud/instances");
        debug!(url = %url, "Fetching cloud instances");

        let list: CloudInstanceList = self.get_json(&url).await?;
        debug!(
            instance_count = list.cloud_instance.len(),
            "Fetched cloud instances"
        );

        Ok(list.cloud_instance)
    }

    async fn launch_instance(&self, cloud_profile_id: &str) -> Result<InstanceHandle, RemoteError> {
        let url = self.url("app/rest/cloud/instances");
        let body = LaunchRequest::for_profile(cloud_profile_id);
        debug!(
            cloud_profile_id = %cloud_profile_id,
            image_id = %body.image.id,
            "Starting cloud instance"
        );

        let response = self
            .send(Method::POST, &url, self.launch_request(&url, &body))
            .await?;
        let text = self.body(Method::POST, &url, response).await?;

        // The server may answer with an empty or non-JSON body.
        let handle = serde_json::from_str::<InstanceHandle>(&text).unwrap_or_default();
        debug!(instance_id = ?handle.id, state = ?handle.state, "Cloud instance requested");

        Ok(handle)
    }
}
