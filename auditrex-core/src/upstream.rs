//! Authenticated access to the control-plane HTTP API.
//!
//! The fetcher only sees [`ControlPlaneClient`]; this module provides the
//! reqwest-backed implementation, including UAA token acquisition. The token
//! endpoint is discovered from `/v2/info` and the bearer token is cached
//! until shortly before it expires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AuditError, Result};

/// Issues authenticated GETs against the control-plane API.
///
/// `path_and_query` is relative to the API root (e.g. `/v2/events?...`), as
/// the upstream hands back relative next-page URLs. Non-2xx responses and
/// transport failures are both errors.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn get(&self, path_and_query: &str) -> Result<Vec<u8>>;
}

/// Credential material for the upstream API. A static token short-circuits
/// UAA entirely; otherwise client-credentials wins over the password grant.
#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub api_address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token: Option<String>,
    pub skip_ssl_validation: bool,
    pub user_agent: Option<String>,
}

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Renew the cached token this long before UAA says it expires.
const TOKEN_EXPIRY_LEEWAY: Duration = Duration::from_secs(30);

enum Grant {
    Static(String),
    ClientCredentials { id: String, secret: String },
    Password { username: String, password: String },
    None,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct HttpControlPlaneClient {
    http: reqwest::Client,
    api_address: String,
    grant: Grant,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct InfoResponse {
    token_endpoint: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

impl HttpControlPlaneClient {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
        if config.skip_ssl_validation {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder
            .build()
            .map_err(|e| AuditError::Config(format!("building upstream http client: {e}")))?;

        let grant = match (
            config.token,
            config.client_id,
            config.client_secret,
            config.username,
            config.password,
        ) {
            (Some(token), ..) => Grant::Static(token),
            (None, Some(id), Some(secret), _, _) => Grant::ClientCredentials { id, secret },
            (None, _, _, Some(username), Some(password)) => Grant::Password { username, password },
            _ => Grant::None,
        };

        Ok(Self {
            http,
            api_address: config.api_address.trim_end_matches('/').to_string(),
            grant,
            token: Mutex::new(None),
        })
    }

    async fn bearer_token(&self) -> Result<Option<String>> {
        match &self.grant {
            Grant::Static(token) => return Ok(Some(token.clone())),
            Grant::None => return Ok(None),
            _ => {}
        }

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(Some(token.access_token.clone()));
            }
        }

        let fresh = self.request_token().await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(Some(access_token))
    }

    async fn request_token(&self) -> Result<CachedToken> {
        let token_endpoint = self.token_endpoint().await?;
        debug!(token_endpoint = %token_endpoint, "requesting bearer token");

        let request = self.http.post(format!("{token_endpoint}/oauth/token"));
        let request = match &self.grant {
            Grant::ClientCredentials { id, secret } => request
                .basic_auth(id, Some(secret))
                .form(&[("grant_type", "client_credentials")]),
            Grant::Password { username, password } => request
                .basic_auth("cf", Some(""))
                .form(&[
                    ("grant_type", "password"),
                    ("username", username),
                    ("password", password),
                ]),
            Grant::Static(_) | Grant::None => unreachable!("cached grants handled above"),
        };

        let response = request
            .send()
            .await
            .map_err(|e| AuditError::Upstream(format!("token request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Upstream(format!(
                "token request failed with status code {}",
                status.as_u16()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuditError::Decode(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(600));
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_LEEWAY),
        })
    }

    async fn token_endpoint(&self) -> Result<String> {
        let response = self
            .http
            .get(format!("{}/v2/info", self.api_address))
            .send()
            .await
            .map_err(|e| AuditError::Upstream(format!("info request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Upstream(format!(
                "info request failed with status code {}",
                status.as_u16()
            )));
        }
        let info: InfoResponse = response
            .json()
            .await
            .map_err(|e| AuditError::Decode(format!("info response: {e}")))?;
        info.token_endpoint.ok_or_else(|| {
            AuditError::Config("upstream /v2/info did not advertise a token endpoint".to_string())
        })
    }
}

impl std::fmt::Debug for HttpControlPlaneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControlPlaneClient")
            .field("api_address", &self.api_address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn get(&self, path_and_query: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.api_address, path_and_query);
        let mut request = self.http.get(&url);
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuditError::Upstream(format!("error requesting events: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Upstream(format!(
                "request failed with status code {}",
                status.as_u16()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AuditError::Upstream(format!("error reading response body: {e}")))?;
        Ok(body.to_vec())
    }
}
