//! OneDrive folder access through Microsoft Graph.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::contract::{DownloadedImage, ImageRecord, ImageStore, Metadata};
use crate::credentials::TokenProvider;
use crate::error::PipelineError;
use crate::exif;

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// File extensions treated as images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif"];

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    file: Option<serde_json::Value>,
    #[serde(rename = "createdDateTime")]
    created: Option<String>,
    #[serde(rename = "lastModifiedDateTime")]
    modified: Option<String>,
}

impl DriveItem {
    fn into_record(self) -> Option<ImageRecord> {
        if self.file.is_none() || !is_image_name(&self.name) {
            return None;
        }
        let mut record = ImageRecord::new(self.id, self.name);
        record
            .metadata
            .insert("filename".to_string(), record.name.clone());
        if let Some(created) = self.created {
            record.metadata.insert("created".to_string(), created);
        }
        if let Some(modified) = self.modified {
            record.metadata.insert("modified".to_string(), modified);
        }
        Some(record)
    }
}

/// Whether `name` has one of the [`IMAGE_EXTENSIONS`].
pub fn is_image_name(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => IMAGE_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        _ => false,
    }
}

/// `photos/` and `/photos` both become `/photos`; empty means the drive root.
fn normalize_folder(folder: &str) -> String {
    let trimmed = folder.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// Image store backed by one OneDrive folder.
pub struct OneDriveClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
    folder: String,
    processed_folder: Option<String>,
}

impl OneDriveClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenProvider>, folder: &str) -> Self {
        Self {
            http,
            tokens,
            base_url: GRAPH_BASE_URL.to_string(),
            folder: normalize_folder(folder),
            processed_folder: None,
        }
    }

    /// Move posted images here instead of leaving them in the watched folder.
    pub fn with_processed_folder(mut self, folder: Option<&str>) -> Self {
        self.processed_folder = folder
            .map(normalize_folder)
            .filter(|f| !f.is_empty());
        self
    }

    /// Point at a different Graph host, e.g. a local stand-in.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn children_url(&self) -> String {
        if self.folder.is_empty() {
            format!("{}/me/drive/root/children", self.base_url)
        } else {
            format!("{}/me/drive/root:{}:/children", self.base_url, self.folder)
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PipelineError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PipelineError::from_status(status.as_u16(), &body))
    }
}

#[async_trait]
impl ImageStore for OneDriveClient {
    async fn list_images(&self) -> Result<Vec<ImageRecord>, PipelineError> {
        let mut images = Vec::new();
        let mut next = Some(self.children_url());
        let mut pages = 0;
        while let Some(url) = next.take() {
            pages += 1;
            let page: ChildrenPage = self.send(self.http.get(&url)).await?.json().await?;
            debug!(page = pages, items = page.value.len(), "Fetched folder page");
            images.extend(page.value.into_iter().filter_map(DriveItem::into_record));
            next = page.next_link;
        }
        info!(folder = %self.folder, count = images.len(), "Listed images");
        Ok(images)
    }

    async fn download(&self, id: &str) -> Result<DownloadedImage, PipelineError> {
        let url = format!("{}/me/drive/items/{}/content", self.base_url, id);
        let content = self.send(self.http.get(&url)).await?.bytes().await?.to_vec();
        let metadata: Metadata = exif::read_exif(&content).into_metadata();
        debug!(
            id,
            bytes = content.len(),
            metadata_keys = metadata.len(),
            "Downloaded image"
        );
        Ok(DownloadedImage { content, metadata })
    }

    async fn archive(&self, id: &str, name: &str) -> Result<(), PipelineError> {
        let Some(processed) = &self.processed_folder else {
            return Ok(());
        };
        let url = format!("{}/me/drive/items/{}", self.base_url, id);
        let body = serde_json::json!({
            "parentReference": { "path": format!("/drive/root:{processed}") },
            "name": name,
        });
        self.send(self.http.patch(&url).json(&body)).await?;
        info!(id, name, folder = %processed, "Moved image to processed folder");
        Ok(())
    }
}
