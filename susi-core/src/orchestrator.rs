//! The per-image pipeline and the loop that drives it.
//!
//! One cycle lists the watched folder, drops everything already in the
//! [`ProcessedSet`], and runs each remaining image through
//! download → caption → upload → post, strictly one image at a time. A posted
//! image is recorded, archived and reported in a single success email; a
//! failed one gets a single failure email naming the step and stays
//! unrecorded so the next cycle picks it up again.
//!
//! # Failure policy
//! - Transient errors are retried per step with [`RetryPolicy`].
//! - Caption failures never block a post: the title (or the configured
//!   default text) is used instead.
//! - An auth error stops the rest of the cycle, since every following image
//!   would fail the same way.
//! - Notification failures are logged and otherwise ignored.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::caption::fallback_caption;
use crate::config::RetrySettings;
use crate::contract::{
    CaptionGenerator, ImageRecord, ImageStatus, ImageStore, Metadata, Notifier, ObjectStore,
    PostResult, SocialPoster,
};
use crate::error::PipelineError;
use crate::processed::ProcessedSet;
use crate::retry::RetryPolicy;
use crate::schedule::{self, Trigger};

/// Wait before asking a schedule again when it has no next fire time.
const UNSCHEDULABLE_RETRY: Duration = Duration::from_secs(3600);

/// Pipeline step, for failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    List,
    Download,
    Caption,
    Upload,
    Post,
    Record,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::List => "list",
            Step::Download => "download",
            Step::Caption => "caption",
            Step::Upload => "upload",
            Step::Post => "post",
            Step::Record => "record",
        }
    }

    fn subject(self) -> &'static str {
        match self {
            Step::List => "Susi Image Listing Failed",
            Step::Download => "Susi Image Download Failed",
            Step::Caption => "Susi Caption Failed",
            Step::Upload => "Susi S3 Upload Failed",
            Step::Post => "Susi Social Post Failed",
            Step::Record => "Susi State Save Failed",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The remote collaborators of one orchestrator.
pub struct Components {
    pub images: Box<dyn ImageStore>,
    pub captions: Box<dyn CaptionGenerator>,
    pub storage: Box<dyn ObjectStore>,
    pub poster: Box<dyn SocialPoster>,
    pub notifier: Box<dyn Notifier>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub retry: RetrySettings,
    /// Caption used when generation fails and the image has no title.
    pub default_caption: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostedImage {
    pub id: String,
    pub name: String,
    pub caption: String,
    pub image_url: String,
    pub post: PostResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedImage {
    pub id: String,
    pub name: String,
    pub step: Step,
    pub error: String,
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub listed: usize,
    /// Listed images that were already processed.
    pub skipped: usize,
    pub posted: Vec<PostedImage>,
    pub failed: Vec<FailedImage>,
    /// Images left for the next cycle because the cycle was aborted.
    pub deferred: usize,
    pub aborted: bool,
}

/// Images from `listing` whose id is not in `processed`, first occurrence only.
pub fn list_new_images(listing: Vec<ImageRecord>, processed: &ProcessedSet) -> Vec<ImageRecord> {
    let mut seen = std::collections::BTreeSet::new();
    listing
        .into_iter()
        .filter(|image| !processed.contains(&image.id) && seen.insert(image.id.clone()))
        .collect()
}

/// `{id}-{name}` with anything outside `[A-Za-z0-9._-]` replaced by `_`.
pub fn object_key(image: &ImageRecord) -> String {
    let name: String = image
        .name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", image.id, name)
}

pub struct Orchestrator {
    components: Components,
    processed: ProcessedSet,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(components: Components, processed: ProcessedSet, settings: OrchestratorSettings) -> Self {
        Self {
            components,
            processed,
            settings,
        }
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    /// Run one cycle. Errors only when the folder could not be listed.
    pub async fn run_once(&mut self) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("run", run_id = %run_id);
        self.cycle(run_id).instrument(span).await
    }

    async fn cycle(&mut self, run_id: String) -> Result<RunReport, PipelineError> {
        let mut report = RunReport {
            run_id,
            ..RunReport::default()
        };

        let listing = match self
            .settings
            .retry
            .list
            .run("list", || self.components.images.list_images())
            .await
        {
            Ok(listing) => listing,
            Err(e) => {
                error!(error = %e, "Listing images failed");
                self.notify(
                    Step::List.subject(),
                    &format!("Could not list images in the watched folder.\nError: {e}"),
                )
                .await;
                return Err(e);
            }
        };

        report.listed = listing.len();
        let candidates = list_new_images(listing, &self.processed);
        report.skipped = report.listed - candidates.len();
        if candidates.is_empty() {
            info!(listed = report.listed, "No new images");
            return Ok(report);
        }
        info!(new = candidates.len(), skipped = report.skipped, "Processing new images");

        let total = candidates.len();
        for (index, mut image) in candidates.into_iter().enumerate() {
            let span = info_span!("image", id = %image.id, name = %image.name);
            let outcome = self.publish(&mut image).instrument(span).await;

            let abort = match outcome {
                Ok(posted) => {
                    let abort = self.finish_success(&mut image, &posted).await;
                    report.posted.push(posted);
                    abort
                }
                Err((step, e)) => {
                    image.status = ImageStatus::Failed;
                    error!(id = %image.id, step = %step, error = %e, "Image failed");
                    self.notify(
                        step.subject(),
                        &format!(
                            "Failed to {step} image {} (id {}).\nError: {e}",
                            image.name, image.id
                        ),
                    )
                    .await;
                    report.failed.push(FailedImage {
                        id: image.id.clone(),
                        name: image.name.clone(),
                        step,
                        error: e.to_string(),
                    });
                    e.is_auth()
                }
            };

            if abort {
                report.aborted = true;
                report.deferred = total - index - 1;
                warn!(deferred = report.deferred, "Aborting cycle");
                break;
            }
        }

        info!(
            posted = report.posted.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            aborted = report.aborted,
            "Cycle finished"
        );
        Ok(report)
    }

    /// Download, caption, upload and post one image.
    async fn publish(&self, image: &mut ImageRecord) -> Result<PostedImage, (Step, PipelineError)> {
        let retry = &self.settings.retry;
        let c = &self.components;

        let downloaded = retry
            .download
            .run("download", || c.images.download(&image.id))
            .await
            .map_err(|e| (Step::Download, e))?;
        image.content = downloaded.content;
        image.metadata.extend(downloaded.metadata);

        let caption = self.caption(&image.metadata, &retry.caption).await;

        let key = object_key(image);
        let content = &image.content;
        let image_url = retry
            .upload
            .run("upload", || c.storage.upload(content, &key))
            .await
            .map_err(|e| (Step::Upload, e))?;

        let post = retry
            .post
            .run("post", || c.poster.post(&image_url, &caption))
            .await
            .map_err(|e| (Step::Post, e))?;
        info!(platform = c.poster.platform(), post_id = %post.id, "Published");

        Ok(PostedImage {
            id: image.id.clone(),
            name: image.name.clone(),
            caption,
            image_url,
            post,
        })
    }

    async fn caption(&self, metadata: &Metadata, policy: &RetryPolicy) -> String {
        let generated = policy
            .run("caption", || self.components.captions.generate(metadata))
            .await;
        match generated {
            Ok(caption) if !caption.trim().is_empty() => caption,
            Ok(_) => fallback_caption(metadata, &self.settings.default_caption),
            Err(e) => {
                warn!(error = %e, "Caption generation failed, using fallback");
                fallback_caption(metadata, &self.settings.default_caption)
            }
        }
    }

    /// Record, archive and report a posted image. Returns true when the cycle
    /// must stop because the processed set could not be saved.
    async fn finish_success(&mut self, image: &mut ImageRecord, posted: &PostedImage) -> bool {
        let mut abort = false;
        match self.processed.insert(&image.id) {
            Ok(_) => image.status = ImageStatus::Processed,
            Err(e) => {
                error!(id = %image.id, error = %e, "Posted but could not save processed set");
                self.notify(
                    Step::Record.subject(),
                    &format!(
                        "Image {} (id {}) was posted but the processed set could not be saved.\n\
                         It may be posted again after a restart.\nError: {e}",
                        image.name, image.id
                    ),
                )
                .await;
                abort = true;
            }
        }

        if let Err(e) = self.components.images.archive(&image.id, &image.name).await {
            warn!(id = %image.id, error = %e, "Could not archive posted image");
        }

        let link = posted.post.url.as_deref().unwrap_or(posted.post.id.as_str());
        self.notify(
            "Susi Post Created",
            &format!(
                "A post was successfully created for image: {}\n\nCaption:\n{}\n\nImage URL: {}\n{} post: {}",
                image.name, posted.caption, posted.image_url, posted.post.platform, link
            ),
        )
        .await;
        abort
    }

    async fn notify(&self, subject: &str, body: &str) {
        if let Err(e) = self.components.notifier.notify(subject, body).await {
            error!(subject, error = %e, "Sending notification failed");
        }
    }

    /// Call [`run_once`](Self::run_once) every `interval` until `shutdown`
    /// resolves. Shutdown is honoured between cycles only.
    pub async fn run_forever<S>(&mut self, interval: Duration, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            self.run_logged().await;
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Run on `trigger` until `shutdown` resolves.
    pub async fn run_scheduled<S>(&mut self, trigger: &Trigger, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        if let Trigger::Polling { interval } = trigger {
            return self.run_forever(*interval, shutdown).await;
        }

        tokio::pin!(shutdown);
        loop {
            let now = chrono::Local::now();
            let Some(next) = trigger.next_fire(&now) else {
                error!(
                    retry_secs = UNSCHEDULABLE_RETRY.as_secs(),
                    "Schedule has no next fire time, checking again later"
                );
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Shutdown requested, stopping");
                        return;
                    }
                    _ = tokio::time::sleep(UNSCHEDULABLE_RETRY) => {}
                }
                continue;
            };
            info!(next = %next.format("%Y-%m-%d %H:%M %Z"), "Waiting for next scheduled run");
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping");
                    return;
                }
                _ = tokio::time::sleep(schedule::until(&now, &next)) => {}
            }
            self.run_logged().await;
        }
    }

    async fn run_logged(&mut self) {
        match self.run_once().await {
            Ok(report) => info!(
                run_id = %report.run_id,
                posted = report.posted.len(),
                failed = report.failed.len(),
                "Run complete"
            ),
            Err(e) => error!(error = %e, "Run failed"),
        }
    }
}
