use std::collections::HashMap;
use std::time::Duration;

use crate::sync::CONVERSATIONS;
use crate::sync::backoff::Backoff;
use crate::sync::coverage::CoveragePolicy;
use crate::sync::fetch::RetryPolicy;
use crate::sync::rate_limit::RateLimitConfig;

const MAX_AGE_PREFIX: &str = "CONVO_MAX_AGE_SECS_";

const DEFAULT_MAX_AGE_SECS: u64 = 900;
const DEFAULT_MERGE_TOLERANCE_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_PER_MINUTE: u64 = 1_000;
const DEFAULT_RATE_LIMIT_HEADROOM: f64 = 0.9;
const DEFAULT_RETRY_ATTEMPTS: u64 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_SWEEP_SECS: u64 = 300;
const DEFAULT_SWEEP_LOOKBACK_DAYS: u64 = 30;
const DEFAULT_SYNC_WAIT_MS: u64 = 20_000;
const DEFAULT_COALESCE_WINDOW_MS: u64 = 50;
const DEFAULT_MAX_PAGES_PER_JOB: u64 = 500;
const DEFAULT_MAX_JOB_SECS: u64 = 600;
const DEFAULT_WORKERS: u64 = 4;
const DEFAULT_PAGE_SIZE: u64 = 150;
const DEFAULT_POINT_LOOKUP_COOLDOWN_SECS: u64 = 300;
const DEFAULT_MAX_RESPONSE_BYTES: u64 = 48_000;

/// Tunables of the sync engine and the tool surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_max_age: Duration,
    /// Keyed by lowercase stream id.
    pub stream_max_age: HashMap<String, Duration>,
    pub merge_tolerance: Duration,
    pub rate_limit_per_minute: u32,
    pub rate_limit_headroom: f64,
    pub retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub sweep_interval: Duration,
    pub sweep_lookback: Duration,
    pub sync_wait: Duration,
    pub coalesce_window: Duration,
    pub max_pages_per_job: u32,
    pub max_job_duration: Duration,
    pub workers: usize,
    pub page_size: u32,
    pub point_lookup_cooldown: Duration,
    pub max_response_bytes: usize,
    pub hot_streams: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_vars(std::iter::empty())
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let u64_var = |name: &str, default: u64| read_u64_var(&vars, name, default);

        let stream_max_age = vars
            .iter()
            .filter_map(|(name, value)| {
                let stream = name.strip_prefix(MAX_AGE_PREFIX)?;
                let secs = value.trim().parse::<u64>().ok().filter(|secs| *secs > 0)?;
                Some((stream.to_ascii_lowercase(), Duration::from_secs(secs)))
            })
            .collect();
        let rate_limit_headroom = vars
            .get("CONVO_RATE_LIMIT_HEADROOM")
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0 && *value <= 1.0)
            .unwrap_or(DEFAULT_RATE_LIMIT_HEADROOM);

        Self {
            default_max_age: Duration::from_secs(u64_var("CONVO_MAX_AGE_SECS", DEFAULT_MAX_AGE_SECS)),
            stream_max_age,
            merge_tolerance: Duration::from_secs(u64_var(
                "CONVO_MERGE_TOLERANCE_SECS",
                DEFAULT_MERGE_TOLERANCE_SECS,
            )),
            rate_limit_per_minute: saturating_u32(u64_var(
                "CONVO_RATE_LIMIT_PER_MINUTE",
                DEFAULT_RATE_LIMIT_PER_MINUTE,
            )),
            rate_limit_headroom,
            retry_attempts: saturating_u32(u64_var("CONVO_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)),
            backoff_base: Duration::from_millis(u64_var(
                "CONVO_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )),
            backoff_max: Duration::from_millis(u64_var(
                "CONVO_BACKOFF_MAX_MS",
                DEFAULT_BACKOFF_MAX_MS,
            )),
            sweep_interval: Duration::from_secs(u64_var("CONVO_SWEEP_SECS", DEFAULT_SWEEP_SECS)),
            sweep_lookback: Duration::from_secs(
                u64_var("CONVO_SWEEP_LOOKBACK_DAYS", DEFAULT_SWEEP_LOOKBACK_DAYS)
                    .saturating_mul(86_400),
            ),
            sync_wait: Duration::from_millis(u64_var("CONVO_SYNC_WAIT_MS", DEFAULT_SYNC_WAIT_MS)),
            coalesce_window: Duration::from_millis(u64_var(
                "CONVO_COALESCE_WINDOW_MS",
                DEFAULT_COALESCE_WINDOW_MS,
            )),
            max_pages_per_job: saturating_u32(u64_var(
                "CONVO_MAX_PAGES_PER_JOB",
                DEFAULT_MAX_PAGES_PER_JOB,
            )),
            max_job_duration: Duration::from_secs(u64_var(
                "CONVO_MAX_JOB_SECS",
                DEFAULT_MAX_JOB_SECS,
            )),
            workers: usize::try_from(u64_var("CONVO_WORKERS", DEFAULT_WORKERS)).unwrap_or(1),
            page_size: saturating_u32(u64_var("CONVO_PAGE_SIZE", DEFAULT_PAGE_SIZE)).min(150),
            point_lookup_cooldown: Duration::from_secs(u64_var(
                "CONVO_POINT_LOOKUP_COOLDOWN_SECS",
                DEFAULT_POINT_LOOKUP_COOLDOWN_SECS,
            )),
            max_response_bytes: usize::try_from(u64_var(
                "CONVO_MAX_RESPONSE_BYTES",
                DEFAULT_MAX_RESPONSE_BYTES,
            ))
            .unwrap_or(usize::MAX),
            hot_streams: vec![CONVERSATIONS.to_string()],
        }
    }

    pub fn coverage_policy(&self) -> CoveragePolicy {
        CoveragePolicy {
            default_max_age: self.default_max_age,
            stream_max_age: self.stream_max_age.clone(),
            merge_tolerance: self.merge_tolerance,
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::from_published(self.rate_limit_per_minute, self.rate_limit_headroom)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_attempts,
            backoff: Backoff::new(self.backoff_base, self.backoff_max.max(self.backoff_base), true),
        }
    }
}

fn read_u64_var(vars: &HashMap<String, String>, name: &str, default: u64) -> u64 {
    vars.get(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
