use std::{
    env,
    time::{SystemTime, UNIX_EPOCH},
};

// ── Defaults ───────────────────────────────────────────────────────────

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_JOB_CONCURRENCY: usize = 4;
pub const DEFAULT_SIM_THREADS: usize = 4;

// ── Env helpers ────────────────────────────────────────────────────────

pub fn env_default(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_default(key).and_then(|value| value.parse::<T>().ok())
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

// ── Engine configuration ───────────────────────────────────────────────

/// Process-level knobs. Built once at startup (`Default` or `from_env`) and
/// handed to the services that need it; never read ambiently after that.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Auto-import poll cadence.
    pub poll_interval_ms: u64,
    /// TTL for cached simulation results. Results are allowed to go stale
    /// and be recomputed; they are never permanent truth.
    pub cache_ttl_secs: u64,
    /// Bound on concurrently executing simulation jobs.
    pub job_concurrency: usize,
    /// Worker threads inside a single simulation job.
    pub sim_threads: usize,
    pub provider_url: String,
    pub provider_token: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            job_concurrency: DEFAULT_JOB_CONCURRENCY,
            sim_threads: DEFAULT_SIM_THREADS,
            provider_url: String::new(),
            provider_token: String::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();
        if let Some(value) = env_parse::<u64>("BRACKET_POLL_INTERVAL_MS") {
            config.poll_interval_ms = value;
        }
        if let Some(value) = env_parse::<u64>("BRACKET_CACHE_TTL_SECS") {
            config.cache_ttl_secs = value;
        }
        if let Some(value) = env_parse::<usize>("BRACKET_JOB_CONCURRENCY") {
            config.job_concurrency = value.max(1);
        }
        if let Some(value) = env_parse::<usize>("BRACKET_SIM_THREADS") {
            config.sim_threads = value.max(1);
        }
        if let Some(value) = env_default("SPORTS_API_URL") {
            config.provider_url = value;
        }
        if let Some(value) = env_default("SPORTS_API_TOKEN") {
            config.provider_token = value;
        }
        config
    }
}
