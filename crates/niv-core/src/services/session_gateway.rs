use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::stream_transport::HttpStreamTransport;

const VERIFY_TOKEN_PATH: &str = "/api/method/niv_ai.niv_core.api.mobile.verify_token";
const PAIR_PATH: &str = "/api/method/niv_ai.niv_core.api.mobile.pair";
const STREAM_CHAT_PATH: &str = "/api/method/niv_ai.niv_core.api.stream.stream_chat";

const PAIRING_FALLBACK_MESSAGE: &str = "Connection failed";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Site URL is empty")]
    EmptySiteUrl,

    #[error("Pairing code is empty")]
    EmptyCode,

    #[error("Not paired: no session token")]
    NotPaired,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status {0}")]
    Status(u16),

    #[error("{message}")]
    PairingRejected { message: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

/// Result of checking a stored token against the site.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TokenStatus {
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub companies: Vec<Value>,
}

/// Everything the site hands back when a device is paired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedSession {
    pub site_url: String,
    pub token: String,
    pub user: Value,
    pub companies: Vec<Value>,
    pub config: Option<Value>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    message: Option<T>,
}

#[derive(Deserialize)]
struct PairAuth {
    token: String,
}

#[derive(Deserialize)]
struct PairPayload {
    auth: PairAuth,
    #[serde(default)]
    user: Value,
    #[serde(default)]
    companies: Vec<Value>,
    #[serde(default)]
    config: Option<Value>,
}

#[derive(Serialize)]
struct PairRequest<'a> {
    code: &'a str,
    device_name: &'a str,
}

/// Trim, drop trailing slashes and default to https.
pub fn normalize_site_url(raw: &str) -> Result<String, GatewayError> {
    let base = raw.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(GatewayError::EmptySiteUrl);
    }
    if base.starts_with("http") {
        Ok(base.to_string())
    } else {
        Ok(format!("https://{base}"))
    }
}

/// Session-level requests against one site.
#[derive(Clone)]
pub struct SessionGateway {
    client: reqwest::Client,
    site_url: String,
    token: Option<String>,
}

impl SessionGateway {
    pub fn new(site_url: &str) -> Result<Self, GatewayError> {
        Ok(Self {
            client: reqwest::Client::new(),
            site_url: normalize_site_url(site_url)?,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn chat_endpoint(&self) -> String {
        format!("{}{}", self.site_url, STREAM_CHAT_PATH)
    }

    /// Transport bound to this site's chat endpoint and token.
    pub fn stream_transport(&self) -> Result<HttpStreamTransport, GatewayError> {
        let token = self.token.as_deref().ok_or(GatewayError::NotPaired)?;
        Ok(HttpStreamTransport::with_client(
            self.client.clone(),
            self.chat_endpoint(),
            token,
        ))
    }

    /// Ask the site whether the token is still accepted. A non-2xx answer is
    /// reported as an invalid token rather than an error.
    pub async fn verify_token(&self) -> Result<TokenStatus, GatewayError> {
        let token = self.token.as_deref().ok_or(GatewayError::NotPaired)?;
        let url = format!("{}{}", self.site_url, VERIFY_TOKEN_PATH);

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, token)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Token verification rejected");
            return Ok(TokenStatus::default());
        }

        let envelope: Envelope<TokenStatus> = response.json().await?;
        let token_status = envelope.message.unwrap_or_default();
        debug!(
            valid = token_status.valid,
            companies = token_status.companies.len(),
            "Token verified"
        );
        Ok(token_status)
    }

    /// Exchange a pairing code for a session token.
    pub async fn pair(&self, code: &str, device_name: &str) -> Result<PairedSession, GatewayError> {
        let code = code.trim().to_uppercase();
        if code.is_empty() {
            return Err(GatewayError::EmptyCode);
        }
        let url = format!("{}{}", self.site_url, PAIR_PATH);

        let response = self
            .client
            .post(&url)
            .json(&PairRequest {
                code: &code,
                device_name,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            let message = first_server_message(&body)
                .unwrap_or_else(|| PAIRING_FALLBACK_MESSAGE.to_string());
            warn!(status = status.as_u16(), message = %message, "Pairing rejected");
            return Err(GatewayError::PairingRejected { message });
        }

        let envelope: Envelope<PairPayload> = response.json().await?;
        let payload = envelope
            .message
            .ok_or_else(|| GatewayError::InvalidResponse("missing message".into()))?;

        info!(site = %self.site_url, "Device paired");
        Ok(PairedSession {
            site_url: self.site_url.clone(),
            token: payload.auth.token,
            user: payload.user,
            companies: payload.companies,
            config: payload.config,
        })
    }
}

/// `_server_messages` is a JSON-encoded list of JSON-encoded objects.
fn first_server_message(body: &Value) -> Option<String> {
    let encoded = body.get("_server_messages")?.as_str()?;
    let messages: Vec<String> = serde_json::from_str(encoded).ok()?;
    let first: Value = serde_json::from_str(messages.first()?).ok()?;
    first.get("message")?.as_str().map(str::to_string)
}
