use crate::auth::{AccessTokenCache, TokenError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod tokens;

pub use tokens::TokensClient;

pub const DEFAULT_API_URL: &str = "https://api.osc-fr1.scalingo.com";
pub const DEFAULT_AUTH_URL: &str = "https://auth.scalingo.com";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("request failed")]
    Http(#[from] reqwest::Error),

    #[error("access token rejected by the platform")]
    Unauthorized,

    #[error("unexpected status code: {status}: {body}")]
    Status { status: StatusCode, body: String },
}

pub(crate) async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();

    Err(ApiError::Status { status, body })
}

#[derive(Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub auth_url: String,
    pub api_token: String,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field("auth_url", &self.auth_url)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("warship/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// One-time pair of addresses for uploading an artifact and referencing it later.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UploadDestination {
    pub upload_url: String,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
struct SourcesCreateResponse {
    source: UploadDestination,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DeploymentParams {
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeploymentsCreateRequest<'a> {
    deployment: &'a DeploymentParams,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeploymentLinks {
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Deployment {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub links: DeploymentLinks,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DeploymentsCreateResponse {
    deployment: Deployment,
}

#[async_trait]
pub trait SourcesApi: Send + Sync {
    async fn create_source(&self) -> Result<UploadDestination, ApiError>;
}

#[async_trait]
pub trait DeploymentsApi: Send + Sync {
    async fn create_deployment(
        &self,
        app: &str,
        params: &DeploymentParams,
    ) -> Result<Deployment, ApiError>;
}

/// Authenticated client of the platform API.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    api_url: String,
    tokens: Arc<AccessTokenCache<TokensClient>>,
}

impl ApiClient {
    pub fn new(client: Client, config: &ClientConfig) -> Self {
        let exchange = TokensClient::new(client.clone(), &config.auth_url);

        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            tokens: Arc::new(AccessTokenCache::new(exchange, config.api_token.clone())),
            client,
        }
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> &Arc<AccessTokenCache<TokensClient>> {
        &self.tokens
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let access_token = self.tokens.access_token().await?;
        let response = request.bearer_auth(access_token).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("access token rejected, dropping cached token");
            self.tokens.invalidate().await;
            return Err(ApiError::Unauthorized);
        }

        check_status(response).await
    }
}

#[async_trait]
impl SourcesApi for ApiClient {
    async fn create_source(&self) -> Result<UploadDestination, ApiError> {
        let url = format!("{}/v1/sources", self.api_url);

        debug!("create source url -> {}", url);

        let response = self.send(self.client.post(&url)).await?;
        let destination = response.json::<SourcesCreateResponse>().await?.source;

        debug!("upload destination -> {:?}", destination);

        Ok(destination)
    }
}

#[async_trait]
impl DeploymentsApi for ApiClient {
    async fn create_deployment(
        &self,
        app: &str,
        params: &DeploymentParams,
    ) -> Result<Deployment, ApiError> {
        let url = format!("{}/v1/apps/{}/deployments", self.api_url, app);

        let request = DeploymentsCreateRequest { deployment: params };
        let response = self.send(self.client.post(&url).json(&request)).await?;
        let deployment = response.json::<DeploymentsCreateResponse>().await?.deployment;

        info!("deployment created: {}", deployment.id);

        Ok(deployment)
    }
}
