//! The HTTP clients against a local stand-in for Graph, S3, Gmail and the
//! token endpoints.

use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use susi_core::caption::{GenAiCaption, GenAiSettings};
use susi_core::contract::{CaptionGenerator, ImageStore, Metadata, Notifier, ObjectStore, SocialPoster};
use susi_core::credentials::{CredentialStore, OAuthEndpoint, StaticToken, TokenProvider};
use susi_core::instagram::{InstagramPoster, InstagramSettings};
use susi_core::notify::GmailNotifier;
use susi_core::onedrive::OneDriveClient;
use susi_core::retry::RetryPolicy;
use susi_core::s3::{S3Settings, S3Uploader};
use susi_core::PipelineError;
use tempfile::tempdir;

struct Route {
    method: Method,
    path: String,
    status: u16,
    body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    path: String,
    query: String,
    authorization: Option<String>,
    body: String,
}

#[derive(Clone, Default)]
struct Fake {
    routes: Arc<Mutex<Vec<Route>>>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Fake {
    fn route(&self, method: Method, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes.lock().unwrap().push(Route {
            method,
            path: path.to_string(),
            status,
            body: body.into(),
        });
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

async fn handle(
    State(fake): State<Fake>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    fake.seen.lock().unwrap().push(Seen {
        method: method.clone(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    let routes = fake.routes.lock().unwrap();
    match routes
        .iter()
        .find(|r| r.method == method && r.path == uri.path())
    {
        Some(route) => (
            StatusCode::from_u16(route.status).unwrap(),
            route.body.clone(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "no route").into_response(),
    }
}

async fn serve() -> (String, Fake) {
    let fake = Fake::default();
    let app = Router::new().fallback(handle).with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), fake)
}

fn bearer(token: &str) -> Arc<dyn TokenProvider> {
    Arc::new(StaticToken(token.to_string()))
}

#[tokio::test]
async fn onedrive_listing_follows_pages_and_keeps_images_only() {
    let (base, fake) = serve().await;
    fake.route(
        Method::GET,
        "/me/drive/root:/SusiImages:/children",
        200,
        serde_json::json!({
            "value": [
                { "id": "img1", "name": "sunset.jpg", "file": {}, "createdDateTime": "2024-05-01T10:00:00Z" },
                { "id": "dir1", "name": "processed", "folder": { "childCount": 3 } },
                { "id": "doc1", "name": "notes.txt", "file": {} }
            ],
            "@odata.nextLink": format!("{base}/page2")
        })
        .to_string(),
    );
    fake.route(
        Method::GET,
        "/page2",
        200,
        serde_json::json!({ "value": [ { "id": "img2", "name": "dunes.PNG", "file": {} } ] })
            .to_string(),
    );

    let client = OneDriveClient::new(reqwest::Client::new(), bearer("tok"), "SusiImages/")
        .with_base_url(&base);
    let images = client.list_images().await.unwrap();

    let ids: Vec<_> = images.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["img1", "img2"]);
    assert_eq!(images[0].metadata.get("filename").unwrap(), "sunset.jpg");
    assert_eq!(
        images[0].metadata.get("created").unwrap(),
        "2024-05-01T10:00:00Z"
    );
    let seen = fake.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen
        .iter()
        .all(|s| s.authorization.as_deref() == Some("Bearer tok")));
}

#[tokio::test]
async fn onedrive_download_and_archive() {
    let (base, fake) = serve().await;
    fake.route(
        Method::GET,
        "/me/drive/items/img1/content",
        200,
        vec![0xFF, 0xD8, 0xFF, 0xD9],
    );
    fake.route(Method::PATCH, "/me/drive/items/img1", 200, "{}");

    let client = OneDriveClient::new(reqwest::Client::new(), bearer("tok"), "/SusiImages")
        .with_processed_folder(Some("SusiImages/processed"))
        .with_base_url(&base);

    let downloaded = client.download("img1").await.unwrap();
    assert_eq!(downloaded.content, vec![0xFF, 0xD8, 0xFF, 0xD9]);
    assert!(downloaded.metadata.is_empty());

    client.archive("img1", "sunset.jpg").await.unwrap();
    let patch = fake
        .seen()
        .into_iter()
        .find(|s| s.method == Method::PATCH)
        .unwrap();
    let body: serde_json::Value = serde_json::from_str(&patch.body).unwrap();
    assert_eq!(
        body["parentReference"]["path"],
        "/drive/root:/SusiImages/processed"
    );
    assert_eq!(body["name"], "sunset.jpg");
}

#[tokio::test]
async fn onedrive_unauthorized_is_auth_error() {
    let (base, fake) = serve().await;
    fake.route(
        Method::GET,
        "/me/drive/items/img1/content",
        401,
        r#"{"error":{"code":"InvalidAuthenticationToken"}}"#,
    );
    let client =
        OneDriveClient::new(reqwest::Client::new(), bearer("tok"), "/x").with_base_url(&base);
    assert!(client.download("img1").await.unwrap_err().is_auth());
}

fn instagram(base: &str) -> InstagramPoster {
    InstagramPoster::new(
        reqwest::Client::new(),
        InstagramSettings {
            access_token: "ig-token".into(),
            user_id: "1784".into(),
            dry_run: false,
            base_url: base.to_string(),
            graph_version: "v19.0".into(),
            max_wait_secs: 0,
            poll_interval_secs: 0,
        },
    )
}

#[tokio::test]
async fn instagram_creates_waits_publishes_and_links() {
    let (base, fake) = serve().await;
    fake.route(Method::POST, "/v19.0/1784/media", 200, r#"{"id":"c1"}"#);
    fake.route(Method::GET, "/v19.0/c1", 200, r#"{"status_code":"FINISHED"}"#);
    fake.route(Method::POST, "/v19.0/1784/media_publish", 200, r#"{"id":"m1"}"#);
    fake.route(
        Method::GET,
        "/v19.0/m1",
        200,
        r#"{"permalink":"https://www.instagram.com/p/abc/"}"#,
    );

    let result = instagram(&base)
        .post("https://bucket.example/img1.jpg", "Sunset")
        .await
        .unwrap();
    assert_eq!(result.platform, "instagram");
    assert_eq!(result.id, "m1");
    assert_eq!(result.url.as_deref(), Some("https://www.instagram.com/p/abc/"));

    let seen = fake.seen();
    let create = &seen[0];
    assert_eq!(create.path, "/v19.0/1784/media");
    assert!(create
        .body
        .contains("image_url=https%3A%2F%2Fbucket.example%2Fimg1.jpg"));
    assert!(create.body.contains("caption=Sunset"));
    assert!(seen[1].query.contains("fields=status_code"));
    assert!(seen[2].body.contains("creation_id=c1"));
}

#[tokio::test]
async fn instagram_missing_permalink_is_not_fatal() {
    let (base, fake) = serve().await;
    fake.route(Method::POST, "/v19.0/1784/media", 200, r#"{"id":"c1"}"#);
    fake.route(Method::GET, "/v19.0/c1", 200, r#"{"status_code":"FINISHED"}"#);
    fake.route(Method::POST, "/v19.0/1784/media_publish", 200, r#"{"id":"m1"}"#);

    let result = instagram(&base).post("https://x/a.jpg", "c").await.unwrap();
    assert_eq!(result.id, "m1");
    assert_eq!(result.url, None);
}

#[tokio::test]
async fn instagram_expired_token_is_auth_error() {
    let (base, fake) = serve().await;
    fake.route(
        Method::POST,
        "/v19.0/1784/media",
        400,
        r#"{"error":{"message":"Error validating access token","type":"OAuthException","code":190}}"#,
    );
    let err = instagram(&base).post("https://x/a.jpg", "c").await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(fake.seen().len(), 1);
}

#[tokio::test]
async fn instagram_container_error_is_platform_error() {
    let (base, fake) = serve().await;
    fake.route(Method::POST, "/v19.0/1784/media", 200, r#"{"id":"c1"}"#);
    fake.route(
        Method::GET,
        "/v19.0/c1",
        200,
        r#"{"status_code":"ERROR","status":"Error: image too small"}"#,
    );
    let err = instagram(&base).post("https://x/a.jpg", "c").await.unwrap_err();
    match err {
        PipelineError::Platform { code, message } => {
            assert_eq!(code, "ERROR");
            assert!(message.contains("too small"));
        }
        other => panic!("expected platform error, got {other:?}"),
    }
}

#[tokio::test]
async fn instagram_container_never_ready_is_transient() {
    let (base, fake) = serve().await;
    fake.route(Method::POST, "/v19.0/1784/media", 200, r#"{"id":"c1"}"#);
    fake.route(Method::GET, "/v19.0/c1", 200, r#"{"status_code":"IN_PROGRESS"}"#);
    let err = instagram(&base).post("https://x/a.jpg", "c").await.unwrap_err();
    assert!(err.is_retryable());
}

fn s3_settings(base: &str) -> S3Settings {
    S3Settings {
        s3_bucket: "susi-images".into(),
        region: "eu-central-1".into(),
        access_key_id: "AKID".into(),
        secret_access_key: "secret".into(),
        session_token: None,
        endpoint: Some(base.to_string()),
        s3_url_prefix: None,
        public_read: true,
        key_prefix: "posts/".into(),
    }
}

#[tokio::test]
async fn s3_upload_is_signed_and_returns_public_url() {
    let (base, fake) = serve().await;
    fake.route(Method::PUT, "/susi-images/posts/img1-a.jpg", 200, "");

    let uploader = S3Uploader::new(reqwest::Client::new(), s3_settings(&base));
    let url = uploader.upload(b"jpeg bytes", "img1-a.jpg").await.unwrap();
    assert_eq!(url, format!("{base}/susi-images/posts/img1-a.jpg"));

    let put = &fake.seen()[0];
    assert_eq!(put.body, "jpeg bytes");
    let auth = put.authorization.as_deref().unwrap();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKID/"));
    assert!(auth.contains("/eu-central-1/s3/aws4_request"));
    assert!(auth.contains("SignedHeaders=content-type;host;x-amz-acl;x-amz-content-sha256;x-amz-date"));
}

#[tokio::test]
async fn s3_endpoint_under_a_path_prefix() {
    let (base, fake) = serve().await;
    fake.route(Method::PUT, "/minio/susi-images/posts/img1-a.jpg", 200, "");

    let uploader = S3Uploader::new(
        reqwest::Client::new(),
        s3_settings(&format!("{base}/minio/")),
    );
    let url = uploader.upload(b"jpeg bytes", "img1-a.jpg").await.unwrap();
    assert_eq!(url, format!("{base}/minio/susi-images/posts/img1-a.jpg"));
    assert_eq!(fake.seen()[0].path, "/minio/susi-images/posts/img1-a.jpg");
}

#[tokio::test]
async fn s3_server_error_is_transient() {
    let (base, fake) = serve().await;
    fake.route(Method::PUT, "/susi-images/posts/img1-a.jpg", 503, "SlowDown");
    let uploader = S3Uploader::new(reqwest::Client::new(), s3_settings(&base));
    assert!(uploader
        .upload(b"x", "img1-a.jpg")
        .await
        .unwrap_err()
        .is_retryable());
}

#[tokio::test]
async fn gmail_sends_raw_message() {
    let (base, fake) = serve().await;
    fake.route(
        Method::POST,
        "/gmail/v1/users/me/messages/send",
        200,
        r#"{"id":"msg1"}"#,
    );

    let notifier = GmailNotifier::new(
        reqwest::Client::new(),
        bearer("gmail-token"),
        "bot@example.com",
        "me@example.com",
    )
    .with_retry(RetryPolicy::none())
    .with_base_url(&base);
    notifier
        .notify("Susi Post Created", "A post was created")
        .await
        .unwrap();

    let sent = &fake.seen()[0];
    assert_eq!(sent.authorization.as_deref(), Some("Bearer gmail-token"));
    let body: serde_json::Value = serde_json::from_str(&sent.body).unwrap();
    let raw = URL_SAFE.decode(body["raw"].as_str().unwrap()).unwrap();
    let message = String::from_utf8(raw).unwrap();
    assert!(message.contains("To: me@example.com\r\n"));
    assert!(message.contains("Subject: Susi Post Created\r\n"));
    assert!(message.ends_with("A post was created"));
}

#[tokio::test]
async fn gmail_retries_server_errors() {
    let (base, fake) = serve().await;
    fake.route(Method::POST, "/gmail/v1/users/me/messages/send", 503, "busy");
    let notifier = GmailNotifier::new(reqwest::Client::new(), bearer("t"), "a@x", "b@x")
        .with_retry(RetryPolicy::immediate(2))
        .with_base_url(&base);
    assert!(notifier.notify("s", "b").await.unwrap_err().is_retryable());
    assert_eq!(fake.seen().len(), 2);
}

#[tokio::test]
async fn genai_caption_strips_reasoning() {
    let (base, fake) = serve().await;
    fake.route(
        Method::POST,
        "/v1/chat/completions",
        200,
        serde_json::json!({
            "choices": [ { "message": { "content": "<think>warm light</think>\nGolden hour at the beach #sunset" } } ]
        })
        .to_string(),
    );
    let generator = GenAiCaption::new(
        reqwest::Client::new(),
        GenAiSettings {
            endpoint: format!("{base}/v1/chat/completions"),
            api_key: Some("lm-key".into()),
            model: "local-model".into(),
            system_prompt: "Write captions.".into(),
            max_tokens: 100,
            temperature: 0.5,
        },
    );
    let mut metadata = Metadata::new();
    metadata.insert("title".into(), "Sunset".into());

    let caption = generator.generate(&metadata).await.unwrap();
    assert_eq!(caption, "Golden hour at the beach #sunset");

    let request = &fake.seen()[0];
    assert_eq!(request.authorization.as_deref(), Some("Bearer lm-key"));
    let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["model"], "local-model");
    assert!(body["messages"][1]["content"]
        .as_str()
        .unwrap()
        .contains("Title: Sunset"));
}

fn endpoint(base: &str) -> OAuthEndpoint {
    OAuthEndpoint {
        token_url: format!("{base}/token"),
        client_id: "app-id".into(),
        client_secret: None,
        scopes: vec!["Files.ReadWrite.All".into(), "offline_access".into()],
    }
}

#[tokio::test]
async fn expired_token_is_refreshed_and_persisted() {
    let (base, fake) = serve().await;
    fake.route(
        Method::POST,
        "/token",
        200,
        r#"{"access_token":"fresh","refresh_token":"r2","expires_in":3600,"token_type":"Bearer"}"#,
    );
    let dir = tempdir().unwrap();
    let token_file = dir.path().join("token_result.json");
    let cache_file = dir.path().join("token_cache.bin");
    std::fs::write(
        &token_file,
        r#"{"access_token":"stale","refresh_token":"r1","expires_at":1000}"#,
    )
    .unwrap();

    let store = CredentialStore::load(
        &token_file,
        Some(cache_file.clone()),
        endpoint(&base),
        reqwest::Client::new(),
    )
    .unwrap();
    assert_eq!(store.access_token().await.unwrap(), "fresh");
    // Still valid, so no second refresh.
    assert_eq!(store.access_token().await.unwrap(), "fresh");

    let seen = fake.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].body.contains("grant_type=refresh_token"));
    assert!(seen[0].body.contains("refresh_token=r1"));
    assert!(seen[0].body.contains("client_id=app-id"));

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&token_file).unwrap()).unwrap();
    assert_eq!(saved["access_token"], "fresh");
    assert_eq!(saved["refresh_token"], "r2");
    assert!(saved["expires_at"].as_i64().unwrap() > 1000);
    assert_eq!(std::fs::read(&cache_file).unwrap(), b"fresh");
}

#[tokio::test]
async fn rejected_refresh_is_auth_error() {
    let (base, fake) = serve().await;
    fake.route(
        Method::POST,
        "/token",
        400,
        r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#,
    );
    let dir = tempdir().unwrap();
    let token_file = dir.path().join("token_result.json");
    std::fs::write(
        &token_file,
        r#"{"access_token":"stale","refresh_token":"r1","expires_at":1000}"#,
    )
    .unwrap();

    let store =
        CredentialStore::load(&token_file, None, endpoint(&base), reqwest::Client::new()).unwrap();
    let err = store.access_token().await.unwrap_err();
    assert!(err.is_auth());
    assert!(err.to_string().contains("invalid_grant"));
}

#[tokio::test]
async fn google_auth_token_file_refreshes_with_stored_client() {
    let (base, fake) = serve().await;
    fake.route(
        Method::POST,
        "/token",
        200,
        r#"{"access_token":"ya29.fresh","expires_in":3599,"scope":"https://www.googleapis.com/auth/gmail.send","token_type":"Bearer"}"#,
    );
    let dir = tempdir().unwrap();
    let token_file = dir.path().join("gmail_token.json");
    std::fs::write(
        &token_file,
        r#"{"token":"ya29.stale","refresh_token":"1//r","client_id":"stored-cid","client_secret":"stored-cs","token_uri":"https://oauth2.googleapis.com/token","expiry":"2020-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    let google = OAuthEndpoint {
        client_id: String::new(),
        ..endpoint(&base)
    };
    let store = CredentialStore::load(&token_file, None, google, reqwest::Client::new()).unwrap();
    assert_eq!(store.access_token().await.unwrap(), "ya29.fresh");

    let seen = fake.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].body.contains("client_id=stored-cid"));
    assert!(seen[0].body.contains("client_secret=stored-cs"));
    assert!(seen[0].body.contains("refresh_token=1%2F%2Fr"));

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&token_file).unwrap()).unwrap();
    assert_eq!(saved["access_token"], "ya29.fresh");
    assert_eq!(saved["refresh_token"], "1//r");
    assert_eq!(saved["client_id"], "stored-cid");
    assert_eq!(saved["token_uri"], "https://oauth2.googleapis.com/token");
    assert!(saved["expiry"].as_str().unwrap() > "2020");
}
