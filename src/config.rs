//! Typed, environment-driven configuration (§6 "Configuration",
//! §9 "Dynamically-typed configuration bags -> typed option structs").
//! Every recognized option from §6 gets a field here; validation happens
//! once at construction (`validate()`), never on the hot path, following
//! this codebase's existing env-parsing idiom (`env_required`,
//! `env_parse_or`, `env_bool`).

use std::env;

use crate::autoscaled_pool::AutoscaledPoolOptions;
use crate::errors::ConfigError;
use crate::session::SessionOptions;
use crate::session_pool::SessionPoolOptions;
use crate::system_status::SystemStatusOptions;

/// Helper to get a required environment variable.
fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

/// Helper to parse an environment variable with a default value.
fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Helper to parse a boolean environment variable.
fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

/// `maxRequestsPerCrawl`: `None` means unbounded (∞).
pub type MaxRequestsPerCrawl = Option<u64>;

#[derive(Debug, Clone)]
pub struct StatisticsOptions {
    pub save_error_snapshots: bool,
}

impl Default for StatisticsOptions {
    fn default() -> Self {
        StatisticsOptions {
            save_error_snapshots: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentsOptions {
    /// §9 open question 4: a stronger leasing mode on the queue for
    /// multi-instance scaling.
    pub request_locking: bool,
}

/// Top-level crawler configuration (§6). Recognized options only — an
/// unrecognized environment variable is simply ignored rather than
/// rejected, since env vars are an open namespace; `from_env` never
/// raises `UnknownKey` for that reason (reserved for structured config
/// sources that enumerate keys explicitly).
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub max_requests_per_crawl: MaxRequestsPerCrawl,
    pub max_request_retries: u32,
    pub request_handler_timeout_secs: f64,
    pub session_pool_options: SessionPoolOptions,
    pub autoscaled_pool_options: AutoscaledPoolOptions,
    pub system_status_options: SystemStatusOptions,
    pub statistics_options: StatisticsOptions,
    pub experiments: ExperimentsOptions,
    pub respect_robots_txt_file: bool,
    /// `CRAWLEE_STORAGE_DIR`.
    pub storage_dir: String,
    /// `CRAWLEE_PURGE_ON_START`.
    pub purge_on_start: bool,
    /// `CRAWLEE_INTERNAL_TIMEOUT` (ms): the queue's stall auto-reset
    /// threshold.
    pub internal_timeout_millis: i64,
    /// `CRAWLEE_DEFAULT_BROWSER_PATH` / `CRAWLEE_HEADLESS`: recognized
    /// (parsed, stored) for compatibility with the wider configuration
    /// surface, but deliberately unused by this headless-HTTP core — no
    /// browser automation lives here.
    pub default_browser_path: Option<String>,
    pub headless: bool,
}

impl CrawlerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let min_concurrency: usize = env_parse_or("CRAWLEE_MIN_CONCURRENCY", 1)?;
        let max_concurrency: usize = env_parse_or("CRAWLEE_MAX_CONCURRENCY", 200)?;

        let max_requests_per_crawl: MaxRequestsPerCrawl = match env::var("CRAWLEE_MAX_REQUESTS_PER_CRAWL") {
            Ok(v) => Some(v.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                var: "CRAWLEE_MAX_REQUESTS_PER_CRAWL".into(),
                message: e.to_string(),
            })?),
            Err(_) => None,
        };

        let max_request_retries: u32 = env_parse_or("CRAWLEE_MAX_REQUEST_RETRIES", 3)?;
        let request_handler_timeout_secs: f64 = env_parse_or("CRAWLEE_REQUEST_HANDLER_TIMEOUT_SECS", 60.0)?;

        let session_pool_max_size: usize = env_parse_or("CRAWLEE_SESSION_POOL_MAX_SIZE", 1000)?;
        let session_max_usage_count: u32 = env_parse_or("CRAWLEE_SESSION_MAX_USAGE_COUNT", 50)?;
        let session_max_error_score: f64 = env_parse_or("CRAWLEE_SESSION_MAX_ERROR_SCORE", 3.0)?;
        let session_error_score_decrement: f64 = env_parse_or("CRAWLEE_SESSION_ERROR_SCORE_DECREMENT", 0.5)?;
        let session_max_age_secs: u64 = env_parse_or("CRAWLEE_SESSION_MAX_AGE_SECS", 3000)?;

        let desired_concurrency_ratio: f64 = env_parse_or("CRAWLEE_DESIRED_CONCURRENCY_RATIO", 0.90)?;
        let scale_up_step_ratio: f64 = env_parse_or("CRAWLEE_SCALE_UP_STEP_RATIO", 0.05)?;
        let scale_down_step_ratio: f64 = env_parse_or("CRAWLEE_SCALE_DOWN_STEP_RATIO", 0.05)?;
        let maybe_run_interval_millis: u64 = env_parse_or("CRAWLEE_MAYBE_RUN_INTERVAL_MILLIS", 500)?;
        let max_tasks_per_minute: Option<u32> = match env::var("CRAWLEE_MAX_TASKS_PER_MINUTE") {
            Ok(v) => Some(v.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                var: "CRAWLEE_MAX_TASKS_PER_MINUTE".into(),
                message: e.to_string(),
            })?),
            Err(_) => None,
        };
        let logging_interval_millis: Option<u64> = if env_bool("CRAWLEE_DISABLE_POOL_LOGGING", false) {
            None
        } else {
            Some(env_parse_or("CRAWLEE_LOGGING_INTERVAL_MILLIS", 60_000)?)
        };
        let abort_timeout_millis: u64 = env_parse_or("CRAWLEE_ABORT_TIMEOUT_MILLIS", 30_000)?;

        let save_error_snapshots = env_bool("CRAWLEE_SAVE_ERROR_SNAPSHOTS", false);
        let request_locking = env_bool("CRAWLEE_EXPERIMENTS_REQUEST_LOCKING", false);
        let respect_robots_txt_file = env_bool("CRAWLEE_RESPECT_ROBOTS_TXT_FILE", false);

        let storage_dir = env::var("CRAWLEE_STORAGE_DIR").unwrap_or_else(|_| "./storage".to_string());
        let purge_on_start = env_bool("CRAWLEE_PURGE_ON_START", false);
        let internal_timeout_millis: i64 = env_parse_or("CRAWLEE_INTERNAL_TIMEOUT", 30_000)?;
        let default_browser_path = env::var("CRAWLEE_DEFAULT_BROWSER_PATH").ok();
        let headless = env_bool("CRAWLEE_HEADLESS", true);

        let config = CrawlerConfig {
            min_concurrency,
            max_concurrency,
            max_requests_per_crawl,
            max_request_retries,
            request_handler_timeout_secs,
            session_pool_options: SessionPoolOptions {
                max_pool_size: session_pool_max_size,
                session_options: SessionOptions {
                    max_usage_count: session_max_usage_count,
                    max_error_score: session_max_error_score,
                    error_score_decrement: session_error_score_decrement,
                    max_age_secs: session_max_age_secs,
                },
                ..Default::default()
            },
            autoscaled_pool_options: AutoscaledPoolOptions {
                min_concurrency,
                max_concurrency,
                desired_concurrency_ratio,
                scale_up_step_ratio,
                scale_down_step_ratio,
                maybe_run_interval_millis,
                max_tasks_per_minute,
                logging_interval_millis,
                abort_timeout_millis,
            },
            system_status_options: SystemStatusOptions::default(),
            statistics_options: StatisticsOptions { save_error_snapshots },
            experiments: ExperimentsOptions { request_locking },
            respect_robots_txt_file,
            storage_dir,
            purge_on_start,
            internal_timeout_millis,
            default_browser_path,
            headless,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_concurrency < 1 {
            return Err(ConfigError::InvalidCombination {
                field: "min_concurrency".into(),
                constraint: "must be >= 1".into(),
            });
        }
        if self.max_concurrency < self.min_concurrency {
            return Err(ConfigError::InvalidCombination {
                field: "max_concurrency".into(),
                constraint: "must be >= min_concurrency".into(),
            });
        }
        if self.request_handler_timeout_secs <= 0.0 {
            return Err(ConfigError::InvalidCombination {
                field: "request_handler_timeout_secs".into(),
                constraint: "must be > 0".into(),
            });
        }
        if self.session_pool_options.max_pool_size < 1 {
            return Err(ConfigError::InvalidCombination {
                field: "session_pool_options.max_pool_size".into(),
                constraint: "must be >= 1".into(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        CrawlerConfig {
            min_concurrency: 1,
            max_concurrency: 1,
            max_requests_per_crawl: None,
            max_request_retries: 3,
            request_handler_timeout_secs: 60.0,
            session_pool_options: SessionPoolOptions::default(),
            autoscaled_pool_options: AutoscaledPoolOptions {
                min_concurrency: 1,
                max_concurrency: 1,
                ..Default::default()
            },
            system_status_options: SystemStatusOptions::default(),
            statistics_options: StatisticsOptions::default(),
            experiments: ExperimentsOptions::default(),
            respect_robots_txt_file: false,
            storage_dir: "./storage".to_string(),
            purge_on_start: false,
            internal_timeout_millis: 30_000,
            default_browser_path: None,
            headless: true,
        }
    }
}
