//! Clients for hosted generation queues.
//!
//! Two completion shapes exist: a queue join followed by a newline-delimited
//! event stream ([`event_stream`]), and a handshake over a duplex socket
//! ([`duplex`]). Both end in the same `process_completed` payload, resolved by
//! [`resolve_completion`].

mod duplex;
mod event_stream;
pub(crate) mod payload;

use std::collections::BTreeMap;
use std::time::Duration;

use queuecast_contracts::catalog::{BackendKind, Protocol};
use queuecast_contracts::jobs::{GenerationJob, JobParams};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::config::EngineConfig;

pub use payload::DEFAULT_NEGATIVE_PROMPT;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("queue join rejected with status {status}")]
    JoinRejected { status: u16 },
    #[error("malformed completion: {0}")]
    MalformedResponse(String),
    #[error("completion channel terminated: {0}")]
    ChannelTerminated(String),
    #[error("upstream reported failure: {0}")]
    UpstreamFailed(String),
    #[error("no completion within {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl BackendError {
    fn from_reqwest(prefix: &str, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::TimedOut(timeout)
        } else {
            Self::Transport(format!("{prefix}: {err}"))
        }
    }

    /// Every failure of a single attempt may succeed on the next one.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// One hosted model. `submit` is a single attempt with no retry.
pub trait GenerationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn submit(&self, prompt: &str, params: &JobParams) -> Result<GenerationJob, BackendError>;
}

/// Queue-backed client for any [`BackendKind`].
#[derive(Debug, Clone)]
pub struct QueueBackend {
    kind: BackendKind,
    base_url: String,
    placeholder: Option<String>,
    job_timeout: Duration,
    http: HttpClient,
}

impl QueueBackend {
    pub fn new(kind: BackendKind, config: &EngineConfig) -> Self {
        Self {
            kind,
            base_url: config.base_url(kind),
            placeholder: config.placeholder(kind).map(str::to_string),
            job_timeout: config.job_timeout,
            http: HttpClient::new(),
        }
    }
}

impl GenerationBackend for QueueBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn submit(&self, prompt: &str, params: &JobParams) -> Result<GenerationJob, BackendError> {
        let (resolution, dims) = self.kind.resolutions().dimensions(params.resolution);
        let mut job = GenerationJob::new(
            self.kind,
            prompt,
            params.clone().with_resolution(resolution),
        );
        let profile = payload::profile(self.kind);
        let data = payload::build_data(self.kind, prompt, &job.params, dims, job.seed());
        job.start();
        tracing::debug!(
            backend = self.kind.name(),
            token = job.correlation_token.as_str(),
            resolution = resolution.as_str(),
            "submitting job"
        );

        let outcome = match self.kind.protocol() {
            Protocol::EventStream => event_stream::run(
                &self.http,
                &event_stream::Target {
                    base_url: &self.base_url,
                    profile,
                    placeholder: self.placeholder.as_deref(),
                    timeout: self.job_timeout,
                },
                &job.correlation_token,
                data,
            ),
            Protocol::DuplexSocket => duplex::run(
                &self.base_url,
                duplex::Session::new(&job.correlation_token, profile, data, &self.base_url),
                self.job_timeout,
            ),
        };

        match outcome {
            Ok(locator) => {
                job.complete(locator);
                Ok(job)
            }
            Err(err) => {
                job.fail();
                tracing::debug!(
                    backend = self.kind.name(),
                    token = job.correlation_token.as_str(),
                    "job failed: {err}"
                );
                Err(err)
            }
        }
    }
}

/// Clients keyed by catalog name.
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Box<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue client for every known backend.
    pub fn hosted(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        for kind in BackendKind::ALL {
            registry.register(QueueBackend::new(kind, config));
        }
        registry
    }

    pub fn register<B: GenerationBackend + 'static>(&mut self, backend: B) {
        self.backends
            .insert(backend.kind().name().to_string(), Box::new(backend));
    }

    pub fn get(&self, kind: BackendKind) -> Option<&dyn GenerationBackend> {
        self.backends.get(kind.name()).map(|backend| backend.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

/// Turns a `process_completed` event into a result locator.
pub(crate) fn resolve_completion(
    event: &Value,
    path: &[payload::PathStep],
    placeholder: Option<&str>,
) -> Result<String, BackendError> {
    if event.get("success").and_then(Value::as_bool) == Some(false) {
        let detail = event
            .get("output")
            .and_then(|output| output.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("job reported success=false");
        return Err(BackendError::UpstreamFailed(detail.to_string()));
    }
    match payload::extract_locator(event, path) {
        Some(locator) => Ok(locator),
        None => placeholder.map(str::to_string).ok_or_else(|| {
            BackendError::MalformedResponse("completion carried no result locator".to_string())
        }),
    }
}
