use crate::api::{check_status, ApiError};
use crate::auth::TokenExchange;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    token: String,
}

/// Client of the authentication service token exchange endpoint.
#[derive(Clone, Debug)]
pub struct TokensClient {
    client: Client,
    auth_url: String,
}

impl TokensClient {
    pub fn new(client: Client, auth_url: &str) -> Self {
        Self {
            client,
            auth_url: auth_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TokenExchange for TokensClient {
    async fn exchange(&self, api_token: &str) -> Result<String, ApiError> {
        let url = format!("{}/v1/tokens/exchange", self.auth_url);

        debug!("token exchange url -> {}", url);

        let response = self
            .client
            .post(&url)
            .basic_auth("", Some(api_token))
            .send()
            .await?;

        let response = check_status(response).await?;

        Ok(response.json::<TokenExchangeResponse>().await?.token)
    }
}
