use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use susi::load_config::{load_config, substitute_env};
use susi_core::config::{EmailProvider, ScheduleMode};
use tempfile::NamedTempFile;

const CONFIG_YAML: &str = r#"
onedrive:
  folder: /SusiImages
  processed_folder: /SusiImages/processed
  client_id: ${SUSI_TEST_ONEDRIVE_ID}
  tenant_id: consumers
aws:
  s3_bucket: my-bucket
  region: eu-central-1
  access_key_id: $SUSI_TEST_AWS_KEY
  secret_access_key: ${SUSI_TEST_AWS_SECRET}
  s3_url_prefix: https://cdn.example.com/${SUSI_TEST_BUCKET_PATH}
instagram:
  access_token: ${SUSI_TEST_IG_TOKEN}
  user_id: "17841400000000000"
caption:
  template: "{title}: {comment}"
  default: New photo
retry:
  upload: { attempts: 5, initial_delay_ms: 10, max_delay_ms: 100 }
"#;

fn write_config(content: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), content).expect("write config");
    file
}

fn set_all() {
    env::set_var("SUSI_TEST_ONEDRIVE_ID", "app-id");
    env::set_var("SUSI_TEST_AWS_KEY", "AKID");
    env::set_var("SUSI_TEST_AWS_SECRET", "aws-secret");
    env::set_var("SUSI_TEST_BUCKET_PATH", "photos");
    env::set_var("SUSI_TEST_IG_TOKEN", "ig-token");
}

fn clear_all() {
    for name in [
        "SUSI_TEST_ONEDRIVE_ID",
        "SUSI_TEST_AWS_KEY",
        "SUSI_TEST_AWS_SECRET",
        "SUSI_TEST_BUCKET_PATH",
        "SUSI_TEST_IG_TOKEN",
    ] {
        env::remove_var(name);
    }
}

#[test]
#[serial]
fn placeholders_are_resolved_from_environment() {
    set_all();
    let file = write_config(CONFIG_YAML);

    let config = load_config(file.path()).expect("Config should load");
    clear_all();

    assert_eq!(config.onedrive.client_id, "app-id");
    assert_eq!(config.aws.access_key_id, "AKID");
    assert_eq!(config.aws.secret_access_key, "aws-secret");
    assert_eq!(
        config.aws.s3_url_prefix.as_deref(),
        Some("https://cdn.example.com/photos")
    );
    assert_eq!(config.instagram.as_ref().unwrap().access_token, "ig-token");
    assert_eq!(config.retry.upload.attempts, 5);
    assert_eq!(config.caption.default, "New photo");
}

#[test]
#[serial]
fn omitted_sections_take_defaults() {
    set_all();
    let file = write_config(CONFIG_YAML);
    let config = load_config(file.path()).expect("Config should load");
    clear_all();

    assert_eq!(config.email.provider, EmailProvider::Log);
    assert_eq!(config.schedule.mode, ScheduleMode::Polling);
    assert_eq!(config.schedule.poll_interval_secs, 3600);
    assert_eq!(config.state.processed_file, PathBuf::from("processed.json"));
    assert_eq!(config.onedrive.token_file, PathBuf::from("token_result.json"));
    assert_eq!(config.retry.download.attempts, 3);
}

#[test]
#[serial]
fn unresolved_required_secret_fails_validation() {
    set_all();
    env::remove_var("SUSI_TEST_AWS_SECRET");
    let file = write_config(CONFIG_YAML);

    let err = load_config(file.path()).expect_err("missing secret must be rejected");
    clear_all();

    let message = format!("{err:#}");
    assert!(
        message.contains("aws.secret_access_key"),
        "unexpected error: {message}"
    );
}

#[test]
#[serial]
fn unset_variable_is_left_verbatim() {
    env::remove_var("SUSI_TEST_NOT_SET");
    env::set_var("SUSI_TEST_HOST", "example.com");
    let resolved = substitute_env("https://$SUSI_TEST_HOST/${SUSI_TEST_NOT_SET}/x").unwrap();
    env::remove_var("SUSI_TEST_HOST");
    assert_eq!(resolved, "https://example.com/${SUSI_TEST_NOT_SET}/x");
}

#[test]
fn missing_file_is_an_error() {
    let err = load_config("/definitely/not/here/susi.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn malformed_yaml_is_an_error() {
    let file = write_config("onedrive: [unclosed\n");
    assert!(load_config(file.path()).is_err());
}

#[test]
#[serial]
fn weekly_schedule_with_bad_day_is_rejected() {
    set_all();
    let file = write_config(&format!(
        "{CONFIG_YAML}schedule:\n  mode: weekly\n  image_day: someday\n"
    ));
    let err = load_config(file.path()).unwrap_err();
    clear_all();
    assert!(format!("{err:#}").contains("someday"));
}
