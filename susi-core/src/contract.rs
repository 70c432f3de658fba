//! # contract: capabilities the orchestrator depends on
//!
//! Every remote collaborator of the image pipeline is expressed here as a
//! small async trait, so the orchestrator never sees a concrete OneDrive, S3,
//! Instagram or Gmail client:
//!
//! - [`ImageStore`]: list and fetch images from the watched folder
//! - [`ObjectStore`]: put bytes somewhere public and return the URL
//! - [`CaptionGenerator`]: turn image metadata into post text
//! - [`SocialPoster`]: publish an image URL plus caption to one platform
//! - [`Notifier`]: send a plain-text email
//!
//! ## Mocking & Testing
//! - All traits are annotated for `mockall`; the generated `Mock*` types are
//!   exported behind the `test-export-mocks` feature so integration tests and
//!   the CLI crate can build deterministic pipelines.
//!
//! ## Adding a platform
//! - Implement [`SocialPoster`] for the new client and select it in the CLI's
//!   component wiring. Nothing in the orchestrator changes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Free-form image metadata (title, comment, filename, ...).
pub type Metadata = BTreeMap<String, String>;

/// Where an image is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    #[default]
    New,
    Processed,
    Failed,
}

/// An image discovered in the watched folder.
///
/// Listing fills `id`, `name` and whatever metadata the listing carries;
/// `content` stays empty until the image is downloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRecord {
    /// Remote item id. Stable across renames, used as the Processed-Set key.
    pub id: String,
    /// File name in the remote folder.
    pub name: String,
    pub metadata: Metadata,
    pub content: Vec<u8>,
    pub status: ImageStatus,
}

impl ImageRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Title metadata, if present and non-blank.
    pub fn title(&self) -> Option<&str> {
        self.metadata
            .get("title")
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
    }
}

/// Bytes and metadata of one downloaded image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadedImage {
    pub content: Vec<u8>,
    pub metadata: Metadata,
}

/// What a platform returned for a published post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostResult {
    /// Platform the post went to (e.g. "instagram").
    pub platform: String,
    /// Remote post identifier.
    pub id: String,
    /// Public link to the post when the platform reports one.
    pub url: Option<String>,
}

/// Read access to the watched cloud folder.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// List every image currently in the folder. Finite, and restartable on
    /// every call: there is no cursor beyond the Processed-Set.
    async fn list_images(&self) -> Result<Vec<ImageRecord>, PipelineError>;

    /// Fetch bytes and metadata for one image.
    async fn download(&self, id: &str) -> Result<DownloadedImage, PipelineError>;

    /// Move a posted image out of the watched folder. Stores without a
    /// processed folder treat this as a no-op.
    async fn archive(&self, id: &str, name: &str) -> Result<(), PipelineError>;
}

/// Public object storage.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `content` under `key` and return a URL reachable without
    /// authentication.
    async fn upload(&self, content: &[u8], key: &str) -> Result<String, PipelineError>;
}

/// Produces post text from image metadata.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CaptionGenerator: Send + Sync {
    async fn generate(&self, metadata: &Metadata) -> Result<String, PipelineError>;
}

/// Publishes an image to one social platform.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SocialPoster: Send + Sync {
    /// Short platform name used in logs and notifications.
    fn platform(&self) -> &'static str;

    async fn post(&self, image_url: &str, caption: &str) -> Result<PostResult, PipelineError>;
}

/// Sends a plain-text notification.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), PipelineError>;
}
