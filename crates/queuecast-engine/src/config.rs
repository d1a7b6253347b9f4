use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use queuecast_contracts::catalog::{BackendKind, MediaKind};

use crate::protocol::payload;
use crate::retry::RetryPolicy;

pub const DEFAULT_IMAGE_PLACEHOLDER: &str =
    "https://raw.githubusercontent.com/hihumanzone/Gemini-Discord-Bot/main/error.png";
pub const DEFAULT_AUDIO_PLACEHOLDER: &str =
    "https://raw.githubusercontent.com/hihumanzone/Gemini-Discord-Bot/main/error.mp3";
pub const DEFAULT_CHAT_MODEL: &str = "gemini-pro";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const RETRY_ATTEMPTS_DEFAULT: usize = 3;
const RETRY_ATTEMPTS_MAX: usize = 10;
const RETRY_DELAY_MS_DEFAULT: u64 = 1000;
const STREAM_RETRY_DELAY_MS_DEFAULT: u64 = 500;
const EDIT_INTERVAL_MS_DEFAULT: u64 = 500;
const JOB_TIMEOUT_S_DEFAULT: u64 = 300;
const CANCEL_WINDOW_S_DEFAULT: u64 = 300;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry_attempts: usize,
    pub retry_delay: Duration,
    pub stream_retry_delay: Duration,
    pub edit_interval: Duration,
    pub job_timeout: Duration,
    pub cancel_window: Duration,
    pub image_placeholder: String,
    pub audio_placeholder: String,
    pub state_path: PathBuf,
    pub events_path: Option<PathBuf>,
    pub chat_model: String,
    pub gemini_api_base: String,
    pub gemini_api_key: Option<String>,
    pub safety_threshold: String,
    base_overrides: HashMap<BackendKind, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_attempts: RETRY_ATTEMPTS_DEFAULT,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS_DEFAULT),
            stream_retry_delay: Duration::from_millis(STREAM_RETRY_DELAY_MS_DEFAULT),
            edit_interval: Duration::from_millis(EDIT_INTERVAL_MS_DEFAULT),
            job_timeout: Duration::from_secs(JOB_TIMEOUT_S_DEFAULT),
            cancel_window: Duration::from_secs(CANCEL_WINDOW_S_DEFAULT),
            image_placeholder: DEFAULT_IMAGE_PLACEHOLDER.to_string(),
            audio_placeholder: DEFAULT_AUDIO_PLACEHOLDER.to_string(),
            state_path: PathBuf::from("queuecast-state.json"),
            events_path: None,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            gemini_api_key: None,
            safety_threshold: "BLOCK_NONE".to_string(),
            base_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    /// Builds a config from `lookup`, which returns trimmed non-empty values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, min: u64, max: u64, fallback: Duration| {
            lookup(key)
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(|value| Duration::from_millis(value.clamp(min, max)))
                .unwrap_or(fallback)
        };
        let seconds = |key: &str, min: u64, max: u64, fallback: Duration| {
            lookup(key)
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(|value| Duration::from_secs(value.clamp(min, max)))
                .unwrap_or(fallback)
        };

        let mut base_overrides = HashMap::new();
        for kind in BackendKind::ALL {
            let key = format!("QUEUECAST_BASE_URL_{}", env_suffix(kind));
            if let Some(url) = lookup(&key) {
                base_overrides.insert(kind, url.trim_end_matches('/').to_string());
            }
        }

        Self {
            retry_attempts: lookup("QUEUECAST_RETRY_ATTEMPTS")
                .and_then(|raw| raw.parse::<usize>().ok())
                .map(|value| value.clamp(1, RETRY_ATTEMPTS_MAX))
                .unwrap_or(defaults.retry_attempts),
            retry_delay: millis("QUEUECAST_RETRY_DELAY_MS", 0, 60_000, defaults.retry_delay),
            stream_retry_delay: millis(
                "QUEUECAST_STREAM_RETRY_DELAY_MS",
                0,
                60_000,
                defaults.stream_retry_delay,
            ),
            edit_interval: millis(
                "QUEUECAST_EDIT_INTERVAL_MS",
                50,
                10_000,
                defaults.edit_interval,
            ),
            job_timeout: seconds("QUEUECAST_JOB_TIMEOUT_S", 5, 3600, defaults.job_timeout),
            cancel_window: seconds(
                "QUEUECAST_CANCEL_WINDOW_S",
                10,
                3600,
                defaults.cancel_window,
            ),
            image_placeholder: lookup("QUEUECAST_IMAGE_PLACEHOLDER")
                .unwrap_or(defaults.image_placeholder),
            audio_placeholder: lookup("QUEUECAST_AUDIO_PLACEHOLDER")
                .unwrap_or(defaults.audio_placeholder),
            state_path: lookup("QUEUECAST_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_path),
            events_path: lookup("QUEUECAST_EVENTS_PATH").map(PathBuf::from),
            chat_model: lookup("QUEUECAST_CHAT_MODEL").unwrap_or(defaults.chat_model),
            gemini_api_base: lookup("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.gemini_api_base),
            gemini_api_key: lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY")),
            safety_threshold: lookup("QUEUECAST_SAFETY_THRESHOLD")
                .unwrap_or(defaults.safety_threshold),
            base_overrides,
        }
    }

    pub fn with_base_url(mut self, kind: BackendKind, url: impl Into<String>) -> Self {
        self.base_overrides.insert(kind, url.into());
        self
    }

    pub fn base_url(&self, kind: BackendKind) -> String {
        self.base_overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| payload::profile(kind).base_url.to_string())
    }

    /// Locator used when a completed job carries no result, if the backend allows one.
    pub fn placeholder(&self, kind: BackendKind) -> Option<&str> {
        match kind {
            BackendKind::AnimateDiff | BackendKind::MusicGen => None,
            _ => match kind.media() {
                MediaKind::Image => Some(self.image_placeholder.as_str()),
                MediaKind::Speech => Some(self.audio_placeholder.as_str()),
                MediaKind::Music | MediaKind::Video => None,
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay)
    }

    pub fn stream_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.stream_retry_delay)
    }
}

fn env_suffix(kind: BackendKind) -> String {
    kind.name()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
