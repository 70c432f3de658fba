//! OAuth token persistence for the OneDrive and Gmail clients.
//!
//! Two files are involved, both produced once by an interactive consent flow
//! that runs outside this process:
//!
//! - a JSON token document (`access_token`, `refresh_token`, expiry, plus
//!   whatever else the identity provider returned, preserved verbatim)
//! - an opaque cache blob. It is read at startup and rewritten after every
//!   refresh; when the JSON document is missing its contents are used as a
//!   bearer token.
//!
//! [`CredentialStore`] owns both files; the HTTP clients only ever see the
//! [`TokenProvider`] capability.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{truncate, PipelineError};

/// Seconds before expiry at which a token is treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;
/// Lifetime assumed when the token endpoint does not report `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// Supplies a currently valid bearer token.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, PipelineError>;
}

/// A fixed token, for APIs configured with a long-lived key.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, PipelineError> {
        if self.0.trim().is_empty() {
            return Err(PipelineError::auth("no access token configured"));
        }
        Ok(self.0.clone())
    }
}

/// Token document as stored on disk and as returned by the token endpoint.
///
/// Also reads the google-auth `authorized_user` layout (`token`, RFC 3339
/// `expiry`, and the client credentials inside the file).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) when `access_token` expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    /// RFC 3339 expiry as written by google-auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenSet {
    /// Fill `expires_at` from `expiry` when only the latter is present.
    pub fn normalize(&mut self) {
        if self.expires_at.is_some() {
            return;
        }
        let Some(expiry) = self.expiry.as_deref() else {
            return;
        };
        match chrono::DateTime::parse_from_rfc3339(expiry) {
            Ok(at) => self.expires_at = Some(at.timestamp()),
            Err(e) => warn!(expiry, error = %e, "Ignoring unreadable token expiry"),
        }
    }

    /// A token without a known expiry is refreshed on first use.
    pub fn needs_refresh(&self, now: i64) -> bool {
        match self.expires_at {
            Some(at) => now > at - EXPIRY_SKEW_SECS,
            None => true,
        }
    }
}

/// Where and how to refresh tokens.
#[derive(Debug, Clone)]
pub struct OAuthEndpoint {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
}

impl OAuthEndpoint {
    /// Microsoft identity platform endpoint for a tenant.
    pub fn microsoft(tenant_id: &str, client_id: &str, client_secret: Option<String>) -> Self {
        Self {
            token_url: format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token"),
            client_id: client_id.to_string(),
            client_secret,
            scopes: vec!["Files.ReadWrite.All".to_string(), "offline_access".to_string()],
        }
    }

    /// Google OAuth endpoint with the Gmail send scope.
    pub fn google(client_id: &str, client_secret: Option<String>) -> Self {
        Self {
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            client_id: client_id.to_string(),
            client_secret,
            scopes: vec!["https://www.googleapis.com/auth/gmail.send".to_string()],
        }
    }
}

#[derive(Debug, Default)]
struct CredentialState {
    tokens: Option<TokenSet>,
    cache: Option<Vec<u8>>,
}

/// File-backed token state with opportunistic refresh.
pub struct CredentialStore {
    token_path: PathBuf,
    cache_path: Option<PathBuf>,
    endpoint: OAuthEndpoint,
    http: reqwest::Client,
    state: Mutex<CredentialState>,
}

impl CredentialStore {
    /// Read the token document and cache blob. Missing files are not an error
    /// here; asking for a token without either is.
    pub fn load(
        token_path: impl Into<PathBuf>,
        cache_path: Option<PathBuf>,
        endpoint: OAuthEndpoint,
        http: reqwest::Client,
    ) -> Result<Self, PipelineError> {
        let token_path = token_path.into();
        let tokens = match std::fs::read_to_string(&token_path) {
            Ok(contents) => {
                let mut tokens = serde_json::from_str::<TokenSet>(&contents).map_err(|e| {
                    PipelineError::auth(format!(
                        "token file {} is not valid: {e}",
                        token_path.display()
                    ))
                })?;
                tokens.normalize();
                Some(tokens)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let cache = match &cache_path {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        info!(
            token_file = %token_path.display(),
            has_tokens = tokens.is_some(),
            has_cache = cache.is_some(),
            "Loaded credential state"
        );
        Ok(Self {
            token_path,
            cache_path,
            endpoint,
            http,
            state: Mutex::new(CredentialState { tokens, cache }),
        })
    }

    /// Force a refresh-token grant and persist the result.
    pub async fn refresh(&self) -> Result<String, PipelineError> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// Persist the current token document and cache blob.
    pub async fn save(&self) -> Result<(), PipelineError> {
        let state = self.state.lock().await;
        self.save_locked(&state)
    }

    async fn refresh_locked(&self, state: &mut CredentialState) -> Result<String, PipelineError> {
        let stored = state.tokens.clone().unwrap_or_default();
        let refresh_token = stored.refresh_token.clone().ok_or_else(|| {
            PipelineError::auth("no refresh token stored; run the OAuth consent flow again")
        })?;
        // Configured client credentials win over the ones kept in the token file.
        let client_id = Some(self.endpoint.client_id.clone())
            .filter(|id| !id.trim().is_empty())
            .or_else(|| stored.client_id.clone())
            .ok_or_else(|| PipelineError::auth("no OAuth client_id configured or stored"))?;
        let client_secret = self
            .endpoint
            .client_secret
            .clone()
            .or_else(|| stored.client_secret.clone());

        let scope = self.endpoint.scopes.join(" ");
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", client_id.as_str()),
        ];
        if let Some(secret) = &client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        debug!(token_url = %self.endpoint.token_url, "Refreshing access token");
        let response = self
            .http
            .post(&self.endpoint.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("token refresh request failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            warn!(status, "Token refresh rejected");
            return Err(classify_refresh_failure(status, &body));
        }

        let mut fresh: TokenSet = serde_json::from_str(&body)
            .map_err(|e| PipelineError::auth(format!("unreadable token response: {e}")))?;
        let lifetime = fresh.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS);
        let expires_at = chrono::Utc::now() + chrono::TimeDelta::seconds(lifetime);
        fresh.expires_at = Some(expires_at.timestamp());
        if stored.expiry.is_some() {
            fresh.expiry = Some(expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        }
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token);
        }
        fresh.client_id = fresh.client_id.or(stored.client_id);
        fresh.client_secret = fresh.client_secret.or(stored.client_secret);
        for (key, value) in stored.extra {
            fresh.extra.entry(key).or_insert(value);
        }
        let access = fresh.access_token.clone();
        state.cache = Some(access.as_bytes().to_vec());
        state.tokens = Some(fresh);
        self.save_locked(state)?;
        info!(token_file = %self.token_path.display(), "Access token refreshed");
        Ok(access)
    }

    fn save_locked(&self, state: &CredentialState) -> Result<(), PipelineError> {
        if let Some(tokens) = &state.tokens {
            let json = serde_json::to_string_pretty(tokens)?;
            write_private(&self.token_path, json.as_bytes())?;
        }
        if let (Some(path), Some(cache)) = (&self.cache_path, &state.cache) {
            write_private(path, cache)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TokenProvider for CredentialStore {
    async fn access_token(&self) -> Result<String, PipelineError> {
        let mut state = self.state.lock().await;
        let now = chrono::Utc::now().timestamp();

        match &state.tokens {
            Some(tokens) if !tokens.needs_refresh(now) => return Ok(tokens.access_token.clone()),
            Some(tokens) if tokens.refresh_token.is_some() => {}
            Some(tokens) => {
                // Nothing to refresh with. A token of unknown age may still work.
                if tokens.expires_at.is_none() {
                    return Ok(tokens.access_token.clone());
                }
                return Err(PipelineError::auth(
                    "access token expired and no refresh token is stored",
                ));
            }
            None => {
                return match &state.cache {
                    Some(bytes) => {
                        let token = String::from_utf8_lossy(bytes).trim().to_string();
                        if token.is_empty() {
                            Err(PipelineError::auth("token cache is empty"))
                        } else {
                            debug!("Using cached bearer token");
                            Ok(token)
                        }
                    }
                    None => Err(PipelineError::auth(format!(
                        "no token found at {}; run the OAuth consent flow",
                        self.token_path.display()
                    ))),
                };
            }
        }

        self.refresh_locked(&mut state).await
    }
}

fn classify_refresh_failure(status: u16, body: &str) -> PipelineError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            let error = v.get("error")?.as_str()?.to_string();
            let description = v
                .get("error_description")
                .and_then(|d| d.as_str())
                .unwrap_or_default();
            Some(format!("{error}: {description}"))
        })
        .unwrap_or_else(|| truncate(body, 300).to_string());
    match status {
        400 | 401 | 403 => PipelineError::auth(format!("token refresh failed ({status}): {detail}")),
        _ => PipelineError::transient(format!("token refresh failed ({status}): {detail}")),
    }
}

/// Write a secret file readable only by the owner.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)?;
    }
    Ok(())
}
