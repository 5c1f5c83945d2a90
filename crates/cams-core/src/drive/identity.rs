//! Google OAuth identity provider
//!
//! Interactive sign-in uses the OAuth 2.0 device authorization flow: the
//! user opens a verification page on any device and types a short code.
//! The refresh token obtained there is kept in local storage and used for
//! silent renewal afterwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::storage::{LocalKey, LocalStore};
use crate::sync::{AccessToken, AuthError, IdentityProvider, IssuedToken, TokenMode};

/// Scopes: the app-private Drive folder, plus the email used as account hint
pub const SCOPES: &str =
    "https://www.googleapis.com/auth/drive.appdata https://www.googleapis.com/auth/userinfo.email";

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// OAuth endpoint URLs
#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub device_code: String,
    pub token: String,
    pub revoke: String,
    pub userinfo: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            device_code: "https://oauth2.googleapis.com/device/code".to_string(),
            token: "https://oauth2.googleapis.com/token".to_string(),
            revoke: "https://oauth2.googleapis.com/revoke".to_string(),
            userinfo: "https://www.googleapis.com/oauth2/v3/userinfo".to_string(),
        }
    }
}

impl GoogleEndpoints {
    /// All endpoints under one base URL (used by tests)
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            device_code: format!("{}/device/code", base),
            token: format!("{}/token", base),
            revoke: format!("{}/revoke", base),
            userinfo: format!("{}/userinfo", base),
        }
    }
}

/// What the user needs to complete a device sign-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCode {
    pub user_code: String,
    pub verification_url: String,
    pub expires_in: Duration,
}

/// Callback showing the device code to the user
pub type DevicePrompt = Arc<dyn Fn(&DeviceCode) + Send + Sync>;

/// Grant kept in local storage
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredGrant {
    refresh_token: String,
    #[serde(default)]
    account: Option<String>,
    obtained_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_uri")]
    verification_url: String,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn access_token(&self) -> AccessToken {
        let expires_at = self
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        AccessToken::new(self.access_token.clone(), expires_at)
    }
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Failure of a single OAuth call
#[derive(Debug)]
enum CallError {
    /// The server answered with an OAuth error code
    Rejected(OAuthErrorBody),
    Network(String),
    Unexpected(String),
}

impl From<CallError> for AuthError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Rejected(body) => match body.error.as_str() {
                "access_denied" => AuthError::Denied,
                "expired_token" => AuthError::Expired,
                "invalid_grant" => AuthError::InteractionRequired,
                _ => AuthError::Provider(match body.error_description {
                    Some(description) => format!("{}: {}", body.error, description),
                    None => body.error,
                }),
            },
            CallError::Network(msg) => AuthError::Network(msg),
            CallError::Unexpected(msg) => AuthError::Provider(msg),
        }
    }
}

/// Google identity provider
pub struct GoogleIdentity {
    http: Client,
    client_id: Option<String>,
    client_secret: Option<String>,
    endpoints: GoogleEndpoints,
    local: Arc<dyn LocalStore>,
    prompt: DevicePrompt,
}

impl GoogleIdentity {
    pub fn new(config: &Config, local: Arc<dyn LocalStore>, prompt: DevicePrompt) -> Self {
        Self {
            http: Client::new(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            endpoints: GoogleEndpoints::default(),
            local,
            prompt,
        }
    }

    pub fn with_endpoints(mut self, endpoints: GoogleEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn client_id(&self) -> Result<&str, AuthError> {
        self.client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthError::Unavailable("client_id is not configured".to_string()))
    }

    fn load_grant(&self) -> Option<StoredGrant> {
        let raw = match self.local.get(LocalKey::Grant) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Failed to read stored grant");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(grant) => Some(grant),
            Err(e) => {
                warn!(error = %e, "Stored grant is unreadable, ignoring it");
                None
            }
        }
    }

    fn store_grant(&self, grant: &StoredGrant) {
        let result = serde_json::to_string(grant)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                self.local
                    .set(LocalKey::Grant, &json)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!(error = %e, "Failed to store grant, silent sign-in will not work");
        }
    }

    fn forget_grant(&self) {
        if let Err(e) = self.local.remove(LocalKey::Grant) {
            warn!(error = %e, "Failed to remove stored grant");
        }
    }

    /// Ask the provider to revoke an access or refresh token
    async fn revoke_secret(&self, secret: &str) -> Result<(), AuthError> {
        let response = self
            .http
            .post(&self.endpoints.revoke)
            .form(&[("token", secret)])
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AuthError::Provider(format!(
                "Revocation returned status {}",
                response.status().as_u16()
            )))
        }
    }

    /// POST a form and decode the JSON answer
    async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<T, CallError> {
        let response = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| CallError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CallError::Network(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| CallError::Unexpected(format!("Invalid response: {}", e)));
        }

        match serde_json::from_str::<OAuthErrorBody>(&body) {
            Ok(error) => Err(CallError::Rejected(error)),
            Err(_) => Err(CallError::Unexpected(format!(
                "Identity provider returned status {}",
                status.as_u16()
            ))),
        }
    }

    fn credentials<'a>(&'a self, client_id: &'a str, form: &mut Vec<(&'a str, &'a str)>) {
        form.push(("client_id", client_id));
        if let Some(secret) = self.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
    }

    /// Silent renewal from the stored refresh token
    async fn refresh(&self, hint: Option<&str>) -> Result<IssuedToken, AuthError> {
        let client_id = self.client_id()?;
        let grant = self.load_grant().ok_or(AuthError::InteractionRequired)?;

        if let (Some(hint), Some(account)) = (hint, grant.account.as_deref()) {
            if hint != account {
                debug!("Stored grant belongs to another account");
                return Err(AuthError::InteractionRequired);
            }
        }

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", grant.refresh_token.as_str()),
        ];
        self.credentials(client_id, &mut form);

        match self
            .post_form::<TokenResponse>(&self.endpoints.token, &form)
            .await
        {
            Ok(response) => {
                debug!("Access token refreshed");
                Ok(IssuedToken {
                    token: response.access_token(),
                    hint: None,
                })
            }
            Err(CallError::Rejected(body)) if body.error == "invalid_grant" => {
                info!("Stored grant was revoked or expired");
                self.forget_grant();
                Err(AuthError::InteractionRequired)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Interactive sign-in through the device authorization flow
    async fn device_sign_in(&self) -> Result<IssuedToken, AuthError> {
        let client_id = self.client_id()?;

        let mut form = vec![("scope", SCOPES)];
        self.credentials(client_id, &mut form);
        let device: DeviceCodeResponse = self
            .post_form(&self.endpoints.device_code, &form)
            .await?;

        let expires_in = Duration::from_secs(device.expires_in);
        (self.prompt)(&DeviceCode {
            user_code: device.user_code.clone(),
            verification_url: device.verification_url.clone(),
            expires_in,
        });

        let deadline = tokio::time::Instant::now() + expires_in;
        let mut interval = Duration::from_secs(device.interval.unwrap_or(5));

        let response = loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::Expired);
            }
            tokio::time::sleep(interval).await;

            let mut form = vec![
                ("grant_type", DEVICE_GRANT_TYPE),
                ("device_code", device.device_code.as_str()),
            ];
            self.credentials(client_id, &mut form);

            match self
                .post_form::<TokenResponse>(&self.endpoints.token, &form)
                .await
            {
                Ok(response) => break response,
                Err(CallError::Rejected(body)) if body.error == "authorization_pending" => {
                    debug!("Waiting for the user to approve the sign-in");
                }
                Err(CallError::Rejected(body)) if body.error == "slow_down" => {
                    interval += Duration::from_secs(5);
                    debug!(?interval, "Provider asked to poll more slowly");
                }
                Err(e) => return Err(e.into()),
            }
        };

        let token = response.access_token();
        let email = self.fetch_email(&token).await;

        match response.refresh_token {
            Some(refresh_token) => self.store_grant(&StoredGrant {
                refresh_token,
                account: email.clone(),
                obtained_at: Utc::now(),
            }),
            None => warn!("No refresh token issued, silent sign-in will not work"),
        }

        info!("Signed in with Google");
        Ok(IssuedToken { token, hint: email })
    }

    /// Email of the signed-in account, if the provider tells us
    async fn fetch_email(&self, token: &AccessToken) -> Option<String> {
        let result = async {
            self.http
                .get(&self.endpoints.userinfo)
                .bearer_auth(token.secret())
                .send()
                .await?
                .error_for_status()?
                .json::<UserInfo>()
                .await
        }
        .await;

        match result {
            Ok(info) => info.email,
            Err(e) => {
                debug!(error = %e, "Account hint lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl IdentityProvider for GoogleIdentity {
    async fn init(&self) -> Result<(), AuthError> {
        self.client_id().map(|_| ())
    }

    async fn request_token(
        &self,
        mode: TokenMode,
        hint: Option<&str>,
    ) -> Result<IssuedToken, AuthError> {
        match mode {
            TokenMode::Silent => self.refresh(hint).await,
            TokenMode::Interactive => self.device_sign_in().await,
        }
    }

    async fn revoke(&self, token: &AccessToken) -> Result<(), AuthError> {
        self.revoke_secret(token.secret()).await
    }

    async fn forget(&self) -> Result<(), AuthError> {
        let grant = self.load_grant();
        // Gone locally even if the provider cannot be reached
        self.forget_grant();

        let Some(grant) = grant else {
            return Ok(());
        };
        match self.revoke_secret(&grant.refresh_token).await {
            Ok(()) => info!("Stored grant revoked"),
            // Revoking the access token may already have ended the grant
            Err(e) => debug!(error = %e, "Stored grant not revoked remotely"),
        }
        Ok(())
    }
}
