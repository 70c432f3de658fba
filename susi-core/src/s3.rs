//! Public image hosting on S3 (or an S3-compatible endpoint).

use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, PayloadChecksumKind, PercentEncodingMode, SignableBody, SignableRequest,
    SigningSettings, UriPathNormalizationMode,
};
use aws_sigv4::sign::v4;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::ObjectStore;
use crate::error::{truncate, PipelineError};

/// Bucket, credentials and URL layout for uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    #[serde(alias = "bucket")]
    pub s3_bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    /// S3-compatible endpoint such as `http://localhost:9000`. Switches to
    /// path-style addressing.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Public base URL for uploaded objects, e.g. a CDN in front of the bucket.
    #[serde(default)]
    pub s3_url_prefix: Option<String>,
    /// Send `x-amz-acl: public-read` with every upload.
    #[serde(default)]
    pub public_read: bool,
    /// Prepended to every object key, e.g. `susi/`.
    #[serde(default)]
    pub key_prefix: String,
}

/// Content type for an object key, by extension.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

/// Percent-encode an object key, keeping `/` separators.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.trim_start_matches('/').bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug)]
struct ObjectLocation {
    url: String,
    host: String,
    path: String,
}

pub struct S3Uploader {
    http: reqwest::Client,
    settings: S3Settings,
    credentials: Credentials,
}

impl S3Uploader {
    pub fn new(http: reqwest::Client, settings: S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            settings.session_token.clone(),
            None,
            "susi-config",
        );
        Self {
            http,
            settings,
            credentials,
        }
    }

    fn location(&self, key: &str) -> Result<ObjectLocation, PipelineError> {
        let encoded_key = encode_key(key);
        match &self.settings.endpoint {
            None => {
                let host = format!(
                    "{}.s3.{}.amazonaws.com",
                    self.settings.s3_bucket, self.settings.region
                );
                Ok(ObjectLocation {
                    url: format!("https://{host}/{encoded_key}"),
                    host,
                    path: format!("/{encoded_key}"),
                })
            }
            Some(endpoint) => {
                let parsed = reqwest::Url::parse(endpoint).map_err(|e| {
                    PipelineError::config(format!("invalid S3 endpoint {endpoint}: {e}"))
                })?;
                let host_name = parsed.host_str().ok_or_else(|| {
                    PipelineError::config(format!("S3 endpoint {endpoint} has no host"))
                })?;
                let host = match parsed.port() {
                    Some(port) => format!("{host_name}:{port}"),
                    None => host_name.to_string(),
                };
                // Endpoints behind a reverse proxy may live under a path.
                let base_path = parsed.path().trim_end_matches('/');
                let path = format!("{base_path}/{}/{encoded_key}", self.settings.s3_bucket);
                Ok(ObjectLocation {
                    url: format!("{}://{host}{path}", parsed.scheme()),
                    host,
                    path,
                })
            }
        }
    }

    /// SigV4 headers for a `PUT` of `content` to `url`: authorization,
    /// `x-amz-date`, `x-amz-content-sha256` and the session token if any.
    fn signing_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        content: &[u8],
        at: SystemTime,
    ) -> Result<Vec<(String, String)>, PipelineError> {
        let identity = self.credentials.clone().into();
        let mut settings = SigningSettings::default();
        settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
        settings.percent_encoding_mode = PercentEncodingMode::Single;
        settings.uri_path_normalization_mode = UriPathNormalizationMode::Disabled;
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.settings.region)
            .name("s3")
            .time(at)
            .settings(settings)
            .build()
            .map_err(|e| PipelineError::config(format!("cannot sign S3 request: {e}")))?
            .into();

        let signable = SignableRequest::new(
            "PUT",
            url,
            headers.iter().copied(),
            SignableBody::Bytes(content),
        )
        .map_err(|e| PipelineError::config(format!("cannot sign S3 request: {e}")))?;
        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| PipelineError::config(format!("cannot sign S3 request: {e}")))?
            .into_parts();
        Ok(instructions
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect())
    }

    /// URL under which `key` is publicly reachable.
    pub fn public_url(&self, key: &str) -> Result<String, PipelineError> {
        match self
            .settings
            .s3_url_prefix
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            Some(prefix) => Ok(format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                encode_key(key)
            )),
            None => Ok(self.location(key)?.url),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Uploader {
    async fn upload(&self, content: &[u8], key: &str) -> Result<String, PipelineError> {
        let key = format!("{}{}", self.settings.key_prefix, key);
        let key = key.as_str();
        let location = self.location(key)?;
        let content_type = content_type_for(key);

        let mut headers = vec![("content-type", content_type)];
        if self.settings.public_read {
            headers.push(("x-amz-acl", "public-read"));
        }
        let signed = self.signing_headers(&location.url, &headers, content, SystemTime::now())?;
        debug!(key, host = %location.host, "Signed S3 upload");

        // reqwest derives Host from the URL itself.
        let mut request = self.http.put(&location.url).body(content.to_vec());
        for (name, value) in &headers {
            request = request.header(*name, *value);
        }
        for (name, value) in &signed {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("S3 upload of {key} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), body = truncate(&body, 300), "S3 rejected upload");
            return Err(PipelineError::transient(format!(
                "S3 upload of {key} returned {status}: {}",
                truncate(&body, 300)
            )));
        }

        let url = self.public_url(key)?;
        info!(key, bytes = content.len(), url = %url, "Uploaded image");
        Ok(url)
    }
}
