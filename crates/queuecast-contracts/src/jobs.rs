use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::catalog::{BackendKind, Resolution};

pub const CORRELATION_TOKEN_LEN: usize = 5;

/// Short token tying a queue join to its completion channel.
///
/// Only needs to keep concurrent callers on one shared queue apart; it is not
/// a secret.
pub fn correlation_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Nine-digit sampler seed, the range the hosted queues accept.
pub fn random_seed() -> u64 {
    rand::thread_rng().gen_range(100_000_000..=999_999_999)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobParams {
    pub resolution: Resolution,
    pub language: Option<String>,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl JobParams {
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationJob {
    pub correlation_token: String,
    pub backend_kind: BackendKind,
    pub prompt: String,
    pub params: JobParams,
    pub status: JobStatus,
    pub result_locator: Option<String>,
}

impl GenerationJob {
    pub fn new(backend_kind: BackendKind, prompt: impl Into<String>, params: JobParams) -> Self {
        Self {
            correlation_token: correlation_token(),
            backend_kind,
            prompt: prompt.into(),
            params,
            status: JobStatus::Queued,
            result_locator: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
    }

    pub fn complete(&mut self, locator: impl Into<String>) {
        self.status = JobStatus::Completed;
        self.result_locator = Some(locator.into());
    }

    pub fn fail(&mut self) {
        self.status = JobStatus::Failed;
        self.result_locator = None;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    /// Seed carried by the params, or a fresh one when the caller left it open.
    pub fn seed(&self) -> u64 {
        self.params.seed.unwrap_or_else(random_seed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn correlation_token_is_five_alphanumerics() {
        for _ in 0..64 {
            let token = correlation_token();
            assert_eq!(token.len(), CORRELATION_TOKEN_LEN);
            assert!(token.chars().all(|ch| ch.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn correlation_tokens_rarely_collide() {
        let tokens: HashSet<String> = (0..200).map(|_| correlation_token()).collect();
        assert!(tokens.len() > 190);
    }

    #[test]
    fn job_moves_through_lifecycle() {
        let mut job = GenerationJob::new(
            BackendKind::Kandinsky,
            "a red fox",
            JobParams::default().with_resolution(Resolution::Wide),
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!job.is_terminal());
        job.start();
        assert_eq!(job.status, JobStatus::Running);
        job.complete("https://x/img.png");
        assert!(job.is_terminal());
        assert_eq!(job.result_locator.as_deref(), Some("https://x/img.png"));
    }

    #[test]
    fn seed_prefers_explicit_value() {
        let job = GenerationJob::new(
            BackendKind::DalleXl,
            "x",
            JobParams {
                seed: Some(123_456_789),
                ..JobParams::default()
            },
        );
        assert_eq!(job.seed(), 123_456_789);
        let random = random_seed();
        assert!((100_000_000..=999_999_999).contains(&random));
    }
}
