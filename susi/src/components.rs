//! Builds the concrete clients named by the configuration and hands them to
//! the orchestrator.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use susi_core::caption::{GenAiCaption, TemplateCaption};
use susi_core::config::{CaptionKind, Config, EmailProvider, Platform};
use susi_core::contract::{CaptionGenerator, Notifier, SocialPoster};
use susi_core::credentials::{CredentialStore, OAuthEndpoint, TokenProvider};
use susi_core::instagram::InstagramPoster;
use susi_core::notify::{GmailNotifier, LogNotifier, SmtpNotifier};
use susi_core::onedrive::OneDriveClient;
use susi_core::orchestrator::{Components, Orchestrator, OrchestratorSettings};
use susi_core::processed::ProcessedSet;
use susi_core::s3::S3Uploader;
use tracing::info;

fn onedrive(config: &Config, http: &reqwest::Client) -> Result<OneDriveClient> {
    let settings = &config.onedrive;
    let tokens = CredentialStore::load(
        &settings.token_file,
        settings.token_cache_file.clone(),
        OAuthEndpoint::microsoft(
            &settings.tenant_id,
            &settings.client_id,
            settings.client_secret.clone(),
        ),
        http.clone(),
    )
    .context("Failed to load OneDrive credentials")?;
    let tokens: Arc<dyn TokenProvider> = Arc::new(tokens);
    Ok(OneDriveClient::new(http.clone(), tokens, &settings.folder)
        .with_processed_folder(settings.processed_folder.as_deref()))
}

fn captions(config: &Config, http: &reqwest::Client) -> Result<Box<dyn CaptionGenerator>> {
    match config.caption.generator {
        CaptionKind::Template => Ok(Box::new(
            TemplateCaption::new(config.caption.template.as_str())
                .context("Invalid caption template")?,
        )),
        CaptionKind::Genai => {
            let settings = config
                .caption
                .genai
                .clone()
                .ok_or_else(|| anyhow!("caption.genai section is required"))?;
            Ok(Box::new(GenAiCaption::new(http.clone(), settings)))
        }
    }
}

fn poster(config: &Config, http: &reqwest::Client) -> Result<Box<dyn SocialPoster>> {
    match config.social.platform {
        Platform::Instagram => {
            let settings = config
                .instagram
                .clone()
                .ok_or_else(|| anyhow!("instagram section is required"))?;
            Ok(Box::new(InstagramPoster::new(http.clone(), settings)))
        }
    }
}

fn notifier(config: &Config, http: &reqwest::Client) -> Result<Box<dyn Notifier>> {
    let email = &config.email;
    match email.provider {
        EmailProvider::Log => Ok(Box::new(LogNotifier)),
        EmailProvider::Gmail => {
            // Left empty, the client id stored in the token file is used.
            let client_id = email.client_id.as_deref().unwrap_or_default();
            let tokens = CredentialStore::load(
                &email.token_file,
                None,
                OAuthEndpoint::google(client_id, email.client_secret.clone()),
                http.clone(),
            )
            .context("Failed to load Gmail credentials")?;
            let tokens: Arc<dyn TokenProvider> = Arc::new(tokens);
            Ok(Box::new(
                GmailNotifier::new(http.clone(), tokens, &email.username, &email.recipient)
                    .with_retry(config.retry.notify.clone()),
            ))
        }
        EmailProvider::Smtp => {
            let notifier = SmtpNotifier::new(
                &email.smtp_server,
                email.smtp_port,
                &email.username,
                &email.password,
                &email.recipient,
            )
            .context("Failed to set up SMTP notifications")?;
            Ok(Box::new(notifier.with_retry(config.retry.notify.clone())))
        }
    }
}

/// Wire every component from `config` into an orchestrator.
pub fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let http = config.http.client()?;
    let components = Components {
        images: Box::new(onedrive(config, &http)?),
        captions: captions(config, &http)?,
        storage: Box::new(S3Uploader::new(http.clone(), config.aws.clone())),
        poster: poster(config, &http)?,
        notifier: notifier(config, &http)?,
    };
    let processed = ProcessedSet::load(&config.state.processed_file).with_context(|| {
        format!(
            "Failed to load processed set from {}",
            config.state.processed_file.display()
        )
    })?;
    info!(
        processed = processed.len(),
        state = %config.state.processed_file.display(),
        "Components ready"
    );
    Ok(Orchestrator::new(
        components,
        processed,
        OrchestratorSettings {
            retry: config.retry.clone(),
            default_caption: config.caption.default.clone(),
        },
    ))
}
