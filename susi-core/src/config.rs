use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::caption::GenAiSettings;
use crate::error::PipelineError;
use crate::instagram::InstagramSettings;
use crate::retry::RetryPolicy;
use crate::s3::S3Settings;
use crate::schedule::Trigger;

/// Everything the agent needs, as read from the YAML file after environment
/// placeholders were substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub onedrive: OneDriveSettings,
    pub aws: S3Settings,
    #[serde(default)]
    pub social: SocialSettings,
    #[serde(default)]
    pub instagram: Option<InstagramSettings>,
    #[serde(default)]
    pub email: EmailSettings,
    #[serde(default)]
    pub caption: CaptionSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub state: StateSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneDriveSettings {
    /// Watched folder, relative to the drive root.
    pub folder: String,
    /// Posted images are moved here when set.
    #[serde(default)]
    pub processed_folder: Option<String>,
    #[serde(default = "OneDriveSettings::default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "OneDriveSettings::default_token_cache_file")]
    pub token_cache_file: Option<PathBuf>,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "OneDriveSettings::default_tenant_id")]
    pub tenant_id: String,
}

impl OneDriveSettings {
    fn default_token_file() -> PathBuf {
        PathBuf::from("token_result.json")
    }

    fn default_token_cache_file() -> Option<PathBuf> {
        Some(PathBuf::from("token_cache.bin"))
    }

    fn default_tenant_id() -> String {
        "common".to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Instagram,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocialSettings {
    #[serde(default)]
    pub platform: Platform,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    Gmail,
    Smtp,
    #[default]
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub provider: EmailProvider,
    /// Sender address.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default = "EmailSettings::default_token_file")]
    pub token_file: PathBuf,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// SMTP relay host, upgraded with STARTTLS.
    #[serde(default)]
    pub smtp_server: String,
    #[serde(default = "EmailSettings::default_smtp_port")]
    pub smtp_port: u16,
    /// SMTP login password; the login name is `username`.
    #[serde(default)]
    pub password: String,
}

impl EmailSettings {
    fn default_token_file() -> PathBuf {
        PathBuf::from("gmail_token.json")
    }

    fn default_smtp_port() -> u16 {
        587
    }
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            provider: EmailProvider::default(),
            username: String::new(),
            recipient: String::new(),
            token_file: Self::default_token_file(),
            client_id: None,
            client_secret: None,
            smtp_server: String::new(),
            smtp_port: Self::default_smtp_port(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptionKind {
    #[default]
    Template,
    Genai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionSettings {
    #[serde(default)]
    pub generator: CaptionKind,
    #[serde(default = "CaptionSettings::default_template")]
    pub template: String,
    /// Used when generation fails and the image has no title.
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub genai: Option<GenAiSettings>,
}

impl CaptionSettings {
    fn default_template() -> String {
        "{title}: {comment}".to_string()
    }
}

impl Default for CaptionSettings {
    fn default() -> Self {
        Self {
            generator: CaptionKind::default(),
            template: Self::default_template(),
            default: String::new(),
            genai: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Polling,
    Weekly,
}

impl std::str::FromStr for ScheduleMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" => Ok(Self::Polling),
            "weekly" | "schedule" => Ok(Self::Weekly),
            other => Err(PipelineError::config(format!("unknown schedule mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default)]
    pub mode: ScheduleMode,
    #[serde(default = "ScheduleSettings::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "ScheduleSettings::default_image_day")]
    pub image_day: String,
    #[serde(default = "ScheduleSettings::default_image_time")]
    pub image_time: String,
}

impl ScheduleSettings {
    fn default_poll_interval_secs() -> u64 {
        3600
    }

    fn default_image_day() -> String {
        "tuesday".to_string()
    }

    fn default_image_time() -> String {
        "09:00".to_string()
    }

    /// The trigger for `mode`, or for the configured mode when `None`.
    pub fn trigger(&self, mode: Option<ScheduleMode>) -> Result<Trigger, PipelineError> {
        match mode.unwrap_or(self.mode) {
            ScheduleMode::Polling => {
                if self.poll_interval_secs == 0 {
                    return Err(PipelineError::config(
                        "schedule.poll_interval_secs must be greater than zero",
                    ));
                }
                Ok(Trigger::Polling {
                    interval: Duration::from_secs(self.poll_interval_secs),
                })
            }
            ScheduleMode::Weekly => Trigger::weekly(&self.image_day, &self.image_time),
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::default(),
            poll_interval_secs: Self::default_poll_interval_secs(),
            image_day: Self::default_image_day(),
            image_time: Self::default_image_time(),
        }
    }
}

/// Retry policy per pipeline step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default)]
    pub list: RetryPolicy,
    #[serde(default)]
    pub download: RetryPolicy,
    #[serde(default)]
    pub caption: RetryPolicy,
    #[serde(default)]
    pub upload: RetryPolicy,
    #[serde(default)]
    pub post: RetryPolicy,
    #[serde(default)]
    pub notify: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    #[serde(default = "StateSettings::default_processed_file")]
    pub processed_file: PathBuf,
}

impl StateSettings {
    fn default_processed_file() -> PathBuf {
        PathBuf::from("processed.json")
    }
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            processed_file: Self::default_processed_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "HttpSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpSettings {
    fn default_timeout_secs() -> u64 {
        30
    }

    /// Shared client with the per-request timeout applied.
    pub fn client(&self) -> Result<reqwest::Client, PipelineError> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .user_agent(concat!("susi/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::config(format!("cannot build HTTP client: {e}")))
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
    /// Also write plain-text logs here, rotated daily.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Rotated log files kept next to `file`.
    #[serde(default = "LoggingSettings::default_max_files")]
    pub max_files: usize,
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_max_files() -> usize {
        5
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            file: None,
            max_files: Self::default_max_files(),
        }
    }
}

/// Blank, or still an environment placeholder nobody filled in.
fn unresolved(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() || v.starts_with("${") {
        return true;
    }
    match v.strip_prefix('$') {
        Some(name) => name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
        None => false,
    }
}

fn require(problems: &mut Vec<String>, field: &str, value: &str) {
    if unresolved(value) {
        problems.push(format!("{field} is missing or unresolved"));
    }
}

impl Config {
    /// Check required fields for the selected components. All problems are
    /// reported at once.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut problems = Vec::new();

        require(&mut problems, "onedrive.client_id", &self.onedrive.client_id);
        require(&mut problems, "aws.s3_bucket", &self.aws.s3_bucket);
        require(&mut problems, "aws.region", &self.aws.region);
        require(&mut problems, "aws.access_key_id", &self.aws.access_key_id);
        require(&mut problems, "aws.secret_access_key", &self.aws.secret_access_key);

        match self.social.platform {
            Platform::Instagram => match &self.instagram {
                None => problems.push("instagram section is required".to_string()),
                Some(ig) if !ig.dry_run => {
                    require(&mut problems, "instagram.access_token", &ig.access_token);
                    require(&mut problems, "instagram.user_id", &ig.user_id);
                }
                Some(_) => {}
            },
        }

        match self.email.provider {
            EmailProvider::Log => {}
            // The OAuth client may also come from the token file itself.
            EmailProvider::Gmail => {
                require(&mut problems, "email.username", &self.email.username);
                require(&mut problems, "email.recipient", &self.email.recipient);
            }
            EmailProvider::Smtp => {
                require(&mut problems, "email.smtp_server", &self.email.smtp_server);
                require(&mut problems, "email.username", &self.email.username);
                require(&mut problems, "email.recipient", &self.email.recipient);
                require(&mut problems, "email.password", &self.email.password);
                if self.email.smtp_port == 0 {
                    problems.push("email.smtp_port must be greater than zero".to_string());
                }
            }
        }
        if self.logging.max_files == 0 {
            problems.push("logging.max_files must be greater than zero".to_string());
        }

        if self.caption.generator == CaptionKind::Genai {
            match &self.caption.genai {
                Some(genai) => require(&mut problems, "caption.genai.endpoint", &genai.endpoint),
                None => problems.push("caption.genai section is required".to_string()),
            }
        }

        if let Err(e) = self.schedule.trigger(None) {
            problems.push(e.to_string());
        }
        if self.http.timeout_secs == 0 {
            problems.push("http.timeout_secs must be greater than zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::config(problems.join("; ")))
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            folder = %self.onedrive.folder,
            bucket = %self.aws.s3_bucket,
            platform = ?self.social.platform,
            email = ?self.email.provider,
            schedule = ?self.schedule.mode,
            "Loaded Config"
        );
        debug!(
            processed_file = %self.state.processed_file.display(),
            timeout_secs = self.http.timeout_secs,
            "Config details"
        );
    }

    /// Human-readable overview without secrets.
    pub fn summary(&self) -> String {
        let trigger = match self.schedule.mode {
            ScheduleMode::Polling => format!("every {}s", self.schedule.poll_interval_secs),
            ScheduleMode::Weekly => {
                format!("weekly on {} at {}", self.schedule.image_day, self.schedule.image_time)
            }
        };
        let dry_run = self.instagram.as_ref().is_some_and(|ig| ig.dry_run);
        format!(
            "folder: {}\nprocessed folder: {}\nbucket: {} ({})\nplatform: {:?}{}\nemail: {:?}\ncaption: {:?}\nschedule: {}\nstate: {}",
            self.onedrive.folder,
            self.onedrive.processed_folder.as_deref().unwrap_or("-"),
            self.aws.s3_bucket,
            self.aws.region,
            self.social.platform,
            if dry_run { " (dry run)" } else { "" },
            self.email.provider,
            self.caption.generator,
            trigger,
            self.state.processed_file.display(),
        )
    }
}
