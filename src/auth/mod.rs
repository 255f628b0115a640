use crate::api::ApiError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Tokens expiring sooner than this are exchanged again before use.
pub const REFRESH_THRESHOLD_MINUTES: i64 = 5;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("fail to get access token")]
    Exchange(#[source] Box<ApiError>),

    #[error("fail to parse jwt token")]
    Parse(#[source] jsonwebtoken::errors::Error),

    #[error("invalid exp date for jwt token")]
    MissingExpiration,
}

/// Converts a long-lived API token into a short-lived access token.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, api_token: &str) -> Result<String, ApiError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct AccessTokenClaims {
    exp: Option<i64>,
}

/// Reads the expiration instant of a JWT without verifying its signature.
pub fn parse_expiration(token: &str) -> Result<DateTime<Utc>, TokenError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let key = DecodingKey::from_secret(&[]);
    let token_data =
        decode::<AccessTokenClaims>(token, &key, &validation).map_err(TokenError::Parse)?;

    token_data
        .claims
        .exp
        .and_then(|exp| DateTime::from_timestamp(exp, 0))
        .ok_or(TokenError::MissingExpiration)
}

/// Process-wide cache of the current access token.
///
/// The whole read-check-refresh-write sequence runs under one lock: concurrent
/// callers that find the token close to expiry wait for a single exchange and
/// then share its result.
pub struct AccessTokenCache<E, C = SystemClock> {
    api_token: String,
    exchange: E,
    clock: C,
    threshold: TimeDelta,
    current: Mutex<Option<AccessToken>>,
}

impl<E: TokenExchange> AccessTokenCache<E> {
    pub fn new(exchange: E, api_token: impl Into<String>) -> Self {
        Self::with_clock(exchange, api_token, SystemClock)
    }
}

impl<E: TokenExchange, C: Clock> AccessTokenCache<E, C> {
    pub fn with_clock(exchange: E, api_token: impl Into<String>, clock: C) -> Self {
        Self {
            api_token: api_token.into(),
            exchange,
            clock,
            threshold: TimeDelta::minutes(REFRESH_THRESHOLD_MINUTES),
            current: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String, TokenError> {
        let mut current = self.current.lock().await;

        if let Some(token) = current.as_ref() {
            if token.expires_at - self.clock.now() >= self.threshold {
                return Ok(token.value.clone());
            }

            debug!("access token expires at {}, refreshing", token.expires_at);
        }

        let value = self
            .exchange
            .exchange(&self.api_token)
            .await
            .map_err(|err| TokenError::Exchange(Box::new(err)))?;

        let expires_at = parse_expiration(&value)?;

        info!("access token exchanged, expires at {}", expires_at);

        *current = Some(AccessToken {
            value: value.clone(),
            expires_at,
        });

        Ok(value)
    }

    /// Drops the cached token so the next call exchanges a new one.
    pub async fn invalidate(&self) {
        if self.current.lock().await.take().is_some() {
            debug!("access token invalidated");
        }
    }

    #[cfg(test)]
    pub(crate) async fn current(&self) -> Option<AccessToken> {
        self.current.lock().await.clone()
    }
}
