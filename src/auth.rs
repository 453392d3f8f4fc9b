use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use url::Url;

use crate::channel::ChannelKind;
use crate::error::{PusherError, Result};

/// Signed token returned by an authorizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub auth: String,
    /// Local member description, only used by presence channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

impl AuthToken {
    pub fn new(auth: impl Into<String>) -> Self {
        Self {
            auth: auth.into(),
            channel_data: None,
        }
    }

    pub fn with_channel_data(mut self, channel_data: impl Into<String>) -> Self {
        self.channel_data = Some(channel_data.into());
        self
    }
}

/// Exchanges a channel name and socket id for a subscription token.
///
/// Called while subscribing to private and presence channels. The subscribe
/// call does not return until the authorizer does.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, channel_name: &str, socket_id: &str) -> Result<AuthToken>;
}

/// Authorizer backed by an application auth endpoint
pub struct HttpAuthorizer {
    endpoint: Url,
    http_client: HttpClient,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
}

impl HttpAuthorizer {
    pub fn new(endpoint: &str) -> Result<Self> {
        let http_client = HttpClient::builder().cookie_store(true).build()?;

        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            http_client,
            headers: HashMap::new(),
            params: HashMap::new(),
        })
    }

    /// Add a header sent with every auth request
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Add a form parameter sent with every auth request
    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, channel_name: &str, socket_id: &str) -> Result<AuthToken> {
        let mut form: HashMap<&str, &str> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        form.insert("socket_id", socket_id);
        form.insert("channel_name", channel_name);

        debug!("Requesting auth for {} from {}", channel_name, self.endpoint);

        let mut request = self.http_client.post(self.endpoint.clone()).form(&form);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            let body: serde_json::Value = response.json().await?;

            if let Some(auth) = body["auth"].as_str() {
                return Ok(AuthToken {
                    auth: auth.to_string(),
                    channel_data: body["channel_data"].as_str().map(str::to_string),
                });
            }

            warn!("Auth endpoint response for {} has no auth field", channel_name);
        }

        Err(PusherError::AuthError(format!(
            "Authentication failed: {}",
            status
        )))
    }
}

/// Authorizer that signs tokens locally with the application secret
#[derive(Debug, Clone)]
pub struct SecretAuthorizer {
    app_key: String,
    app_secret: String,
    user_data: Option<String>,
}

impl SecretAuthorizer {
    pub fn new(app_key: &str, app_secret: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            user_data: None,
        }
    }

    /// Set the `channel_data` presented when joining presence channels,
    /// e.g. `{"user_id":"42","user_info":{"name":"Ada"}}`
    pub fn with_user_data(mut self, user_data: &str) -> Self {
        self.user_data = Some(user_data.to_string());
        self
    }

    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.app_secret.as_bytes())
            .map_err(|_| PusherError::AuthError("HMAC creation failed".to_string()))?;

        mac.update(payload.as_bytes());
        let result = mac.finalize().into_bytes();
        // Auth format: app_key:hex_encoded_hmac
        Ok(format!("{}:{}", self.app_key, hex::encode(result)))
    }
}

#[async_trait]
impl Authorizer for SecretAuthorizer {
    async fn authorize(&self, channel_name: &str, socket_id: &str) -> Result<AuthToken> {
        match ChannelKind::from_name(channel_name) {
            ChannelKind::Presence => {
                let user_data = self.user_data.as_deref().ok_or_else(|| {
                    PusherError::AuthError(format!(
                        "presence channel {} needs user data",
                        channel_name
                    ))
                })?;
                // Format: socket_id:channel_name:channel_data
                let auth = self.sign(&format!("{}:{}:{}", socket_id, channel_name, user_data))?;
                Ok(AuthToken::new(auth).with_channel_data(user_data))
            }
            _ => {
                // Format: socket_id:channel_name
                let auth = self.sign(&format!("{}:{}", socket_id, channel_name))?;
                Ok(AuthToken::new(auth))
            }
        }
    }
}
