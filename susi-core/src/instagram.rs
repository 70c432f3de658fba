//! Instagram publishing through the Graph API content-publishing flow:
//! create a media container, wait for it to finish processing, publish it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contract::{PostResult, SocialPoster};
use crate::error::{truncate, PipelineError};

pub const PLATFORM: &str = "instagram";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramSettings {
    pub access_token: String,
    pub user_id: String,
    /// Log what would be posted instead of calling the API.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "InstagramSettings::default_base_url")]
    pub base_url: String,
    #[serde(default = "InstagramSettings::default_graph_version")]
    pub graph_version: String,
    /// Give up on a container that has not finished processing after this long.
    #[serde(default = "InstagramSettings::default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "InstagramSettings::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl InstagramSettings {
    fn default_base_url() -> String {
        "https://graph.facebook.com".to_string()
    }

    fn default_graph_version() -> String {
        "v19.0".to_string()
    }

    fn default_max_wait_secs() -> u64 {
        60
    }

    fn default_poll_interval_secs() -> u64 {
        5
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status_code: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermalinkResponse {
    permalink: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error_subcode: Option<i64>,
}

/// Map a failed Graph API response onto the pipeline's error taxonomy.
pub fn classify_graph_error(status: u16, body: &str) -> PipelineError {
    let Ok(GraphErrorBody { error }) = serde_json::from_str::<GraphErrorBody>(body) else {
        return PipelineError::from_status(status, body);
    };
    let message = match error.error_subcode {
        Some(sub) => format!("{} (subcode {sub})", error.message),
        None => error.message,
    };
    match error.code {
        Some(190) => PipelineError::auth(format!("instagram token rejected: {message}")),
        Some(1 | 2 | 4 | 17 | 32 | 613) => {
            PipelineError::transient(format!("instagram throttled or unavailable: {message}"))
        }
        _ if status >= 500 => PipelineError::transient(format!("instagram status {status}: {message}")),
        Some(code) => PipelineError::platform(code.to_string(), message),
        None => PipelineError::platform(status.to_string(), message),
    }
}

pub struct InstagramPoster {
    http: reqwest::Client,
    settings: InstagramSettings,
}

impl InstagramPoster {
    pub fn new(http: reqwest::Client, settings: InstagramSettings) -> Self {
        Self { http, settings }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.graph_version,
            path
        )
    }

    async fn read<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, PipelineError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_graph_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| {
            PipelineError::platform(
                "decode",
                format!("unexpected response {}: {e}", truncate(&body, 200)),
            )
        })
    }

    async fn create_container(&self, image_url: &str, caption: &str) -> Result<String, PipelineError> {
        let response = self
            .http
            .post(self.url(&format!("{}/media", self.settings.user_id)))
            .form(&[
                ("image_url", image_url),
                ("caption", caption),
                ("access_token", self.settings.access_token.as_str()),
            ])
            .send()
            .await?;
        let created: IdResponse = self.read(response).await?;
        created
            .id
            .ok_or_else(|| PipelineError::platform("missing_id", "no container id returned"))
    }

    /// Poll until the container is `FINISHED`.
    async fn wait_until_ready(&self, container_id: &str) -> Result<(), PipelineError> {
        let max_wait = Duration::from_secs(self.settings.max_wait_secs);
        let interval = Duration::from_secs(self.settings.poll_interval_secs);
        let started = tokio::time::Instant::now();
        loop {
            let response = self
                .http
                .get(self.url(container_id))
                .query(&[
                    ("fields", "status_code,status"),
                    ("access_token", self.settings.access_token.as_str()),
                ])
                .send()
                .await?;
            let status: StatusResponse = self.read(response).await?;
            match status.status_code.as_deref() {
                Some("FINISHED") => return Ok(()),
                Some(code @ ("ERROR" | "EXPIRED")) => {
                    return Err(PipelineError::platform(
                        code,
                        status
                            .status
                            .unwrap_or_else(|| "media container processing failed".to_string()),
                    ));
                }
                other => debug!(container_id, status = ?other, "Container not ready yet"),
            }
            if started.elapsed() >= max_wait {
                return Err(PipelineError::transient(format!(
                    "container {container_id} not ready after {}s",
                    max_wait.as_secs()
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn publish(&self, container_id: &str) -> Result<String, PipelineError> {
        let response = self
            .http
            .post(self.url(&format!("{}/media_publish", self.settings.user_id)))
            .form(&[
                ("creation_id", container_id),
                ("access_token", self.settings.access_token.as_str()),
            ])
            .send()
            .await?;
        let published: IdResponse = self.read(response).await?;
        published
            .id
            .ok_or_else(|| PipelineError::platform("missing_id", "no media id returned"))
    }

    async fn permalink(&self, media_id: &str) -> Result<Option<String>, PipelineError> {
        let response = self
            .http
            .get(self.url(media_id))
            .query(&[
                ("fields", "permalink"),
                ("access_token", self.settings.access_token.as_str()),
            ])
            .send()
            .await?;
        let link: PermalinkResponse = self.read(response).await?;
        Ok(link.permalink)
    }
}

#[async_trait]
impl SocialPoster for InstagramPoster {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn post(&self, image_url: &str, caption: &str) -> Result<PostResult, PipelineError> {
        if self.settings.dry_run {
            info!(image_url, caption, "Dry run: not posting to Instagram");
            return Ok(PostResult {
                platform: PLATFORM.to_string(),
                id: "dry-run".to_string(),
                url: None,
            });
        }

        let container_id = self.create_container(image_url, caption).await?;
        debug!(container_id = %container_id, "Created media container");
        self.wait_until_ready(&container_id).await?;
        let media_id = self.publish(&container_id).await?;

        let url = match self.permalink(&media_id).await {
            Ok(link) => link,
            Err(e) => {
                warn!(media_id = %media_id, error = %e, "Could not fetch permalink");
                None
            }
        };
        info!(media_id = %media_id, image_url, "Posted to Instagram");
        Ok(PostResult {
            platform: PLATFORM.to_string(),
            id: media_id,
            url,
        })
    }
}
