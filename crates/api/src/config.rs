use std::str::FromStr;
use std::time::Duration;

use stormforge_core::quota::{GlobalLimits, QuotaLimits};

use crate::auth::jwt::JwtConfig;
use crate::engine::supervisor::SupervisorSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set in the environment")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Read `var`, falling back to `default` when unset.
fn env_or<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Like [`env_or`] but rejects zero.
fn env_positive<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let value = env_or(var, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Time allowed for supervisors to wind down on shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// PostgreSQL URL. When absent the server keeps everything in memory.
    pub database_url: Option<String>,
    pub jwt: JwtConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `8000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    /// | `DATABASE_URL`         | unset (in-memory stores)   |
    /// | `JWT_SECRET`           | required                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        let host: String = env_or("HOST", "0.0.0.0".to_string())?;
        if host.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Invalid {
                var: "HOST",
                value: host,
                reason: "not an IP address".into(),
            });
        }

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for origin in &cors_origins {
            if origin.parse::<axum::http::HeaderValue>().is_err() {
                return Err(ConfigError::Invalid {
                    var: "CORS_ORIGINS",
                    value: origin.clone(),
                    reason: "not a valid header value".into(),
                });
            }
        }

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        Ok(Self {
            host,
            port: env_or("PORT", 8000)?,
            cors_origins,
            request_timeout_secs: env_positive("REQUEST_TIMEOUT_SECS", 30)?,
            shutdown_timeout_secs: env_or("SHUTDOWN_TIMEOUT_SECS", 30)?,
            database_url,
            jwt: JwtConfig::from_env()?,
        })
    }
}

/// Engine tuning: tool location, timers, limits and default quotas.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tool_path: String,
    pub stop_grace_secs: u64,
    pub kill_wait_secs: u64,
    pub progress_interval_ms: u64,
    pub output_tail_lines: usize,
    pub job_retention_secs: u64,
    pub retention_sweep_secs: u64,
    pub target_policy_refresh_secs: u64,
    pub max_hosts_per_job: usize,
    pub subscriber_buffer: usize,
    pub ws_heartbeat_interval_secs: u64,
    pub ws_heartbeat_timeout_secs: u64,
    pub default_quota: QuotaLimits,
    pub global_limits: GlobalLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_path: "hping3".into(),
            stop_grace_secs: 5,
            kill_wait_secs: 5,
            progress_interval_ms: 1000,
            output_tail_lines: 200,
            job_retention_secs: 3600,
            retention_sweep_secs: 300,
            target_policy_refresh_secs: 60,
            max_hosts_per_job: 256,
            subscriber_buffer: 256,
            ws_heartbeat_interval_secs: 30,
            ws_heartbeat_timeout_secs: 90,
            default_quota: QuotaLimits::default(),
            global_limits: GlobalLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Load engine settings from environment variables.
    ///
    /// | Env Var                         | Default  |
    /// |---------------------------------|----------|
    /// | `TOOL_PATH`                     | `hping3` |
    /// | `STOP_GRACE_SECS`               | `5`      |
    /// | `KILL_WAIT_SECS`                | `5`      |
    /// | `PROGRESS_INTERVAL_MS`          | `1000`   |
    /// | `OUTPUT_TAIL_LINES`             | `200`    |
    /// | `JOB_RETENTION_SECS`            | `3600`   |
    /// | `RETENTION_SWEEP_SECS`          | `300`    |
    /// | `TARGET_POLICY_REFRESH_SECS`    | `60`     |
    /// | `MAX_HOSTS_PER_JOB`             | `256`    |
    /// | `SUBSCRIBER_BUFFER`             | `256`    |
    /// | `WS_HEARTBEAT_INTERVAL_SECS`    | `30`     |
    /// | `WS_HEARTBEAT_TIMEOUT_SECS`     | `90`     |
    /// | `DEFAULT_MAX_CONCURRENT_JOBS`   | `5`      |
    /// | `DEFAULT_PPS_BUDGET`            | `1000`   |
    /// | `DEFAULT_MAX_SUBMISSIONS`       | `20`     |
    /// | `DEFAULT_RATE_WINDOW_SECS`      | `60`     |
    /// | `DEFAULT_MAX_JOB_DURATION_SECS` | `3600`   |
    /// | `GLOBAL_MAX_CONCURRENT_JOBS`    | `50`     |
    /// | `GLOBAL_PPS_BUDGET`             | `10000`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let tool_path: String = env_or("TOOL_PATH", d.tool_path)?;
        if tool_path.trim().is_empty() {
            return Err(ConfigError::Missing("TOOL_PATH"));
        }

        let config = Self {
            tool_path,
            stop_grace_secs: env_or("STOP_GRACE_SECS", d.stop_grace_secs)?,
            kill_wait_secs: env_positive("KILL_WAIT_SECS", d.kill_wait_secs)?,
            progress_interval_ms: env_or("PROGRESS_INTERVAL_MS", d.progress_interval_ms)?,
            output_tail_lines: env_or("OUTPUT_TAIL_LINES", d.output_tail_lines)?,
            job_retention_secs: env_or("JOB_RETENTION_SECS", d.job_retention_secs)?,
            retention_sweep_secs: env_positive("RETENTION_SWEEP_SECS", d.retention_sweep_secs)?,
            target_policy_refresh_secs: env_positive(
                "TARGET_POLICY_REFRESH_SECS",
                d.target_policy_refresh_secs,
            )?,
            max_hosts_per_job: env_positive("MAX_HOSTS_PER_JOB", d.max_hosts_per_job)?,
            subscriber_buffer: env_positive("SUBSCRIBER_BUFFER", d.subscriber_buffer)?,
            ws_heartbeat_interval_secs: env_positive(
                "WS_HEARTBEAT_INTERVAL_SECS",
                d.ws_heartbeat_interval_secs,
            )?,
            ws_heartbeat_timeout_secs: env_positive(
                "WS_HEARTBEAT_TIMEOUT_SECS",
                d.ws_heartbeat_timeout_secs,
            )?,
            default_quota: QuotaLimits {
                max_concurrent_jobs: env_positive(
                    "DEFAULT_MAX_CONCURRENT_JOBS",
                    d.default_quota.max_concurrent_jobs,
                )?,
                pps_budget: env_positive("DEFAULT_PPS_BUDGET", d.default_quota.pps_budget)?,
                max_submissions: env_positive(
                    "DEFAULT_MAX_SUBMISSIONS",
                    d.default_quota.max_submissions,
                )?,
                rate_window_secs: env_positive(
                    "DEFAULT_RATE_WINDOW_SECS",
                    d.default_quota.rate_window_secs,
                )?,
                max_job_duration_secs: env_positive(
                    "DEFAULT_MAX_JOB_DURATION_SECS",
                    d.default_quota.max_job_duration_secs,
                )?,
            },
            global_limits: GlobalLimits {
                max_concurrent_jobs: env_positive(
                    "GLOBAL_MAX_CONCURRENT_JOBS",
                    d.global_limits.max_concurrent_jobs,
                )?,
                pps_budget: env_positive("GLOBAL_PPS_BUDGET", d.global_limits.pps_budget)?,
            },
        };

        if config.ws_heartbeat_timeout_secs <= config.ws_heartbeat_interval_secs {
            return Err(ConfigError::Invalid {
                var: "WS_HEARTBEAT_TIMEOUT_SECS",
                value: config.ws_heartbeat_timeout_secs.to_string(),
                reason: "must exceed WS_HEARTBEAT_INTERVAL_SECS".into(),
            });
        }
        Ok(config)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            kill_wait: Duration::from_secs(self.kill_wait_secs),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}
