// Server configuration loaded from environment variables

use std::time::Duration;

use leaseflow_durable::{CoordinatorConfig, LeaseConfig, MAX_LEASE_DURATION};

/// Errors while reading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable required")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Which queue service delivers resume and timeout tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskQueueBackend {
    /// In-process timers posting back to this server
    Local,
    /// Google Cloud Tasks
    CloudTasks {
        project_id: String,
        location_id: String,
        queue: String,
        /// Static bearer token; the metadata server is used when absent
        access_token: Option<String>,
    },
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on
    pub bind_addr: String,
    /// Public base URL queue deliveries are sent to
    pub base_public_url: String,
    /// Secret for signing callback tasks
    pub sign_secret: String,
    /// PostgreSQL URL; the in-memory store is used when absent
    pub database_url: Option<String>,
    pub task_queue: TaskQueueBackend,
    /// Allowed CORS origins; empty disables the CORS layer
    pub cors_allowed_origins: Vec<String>,
    pub lease: LeaseConfig,
    pub coordinator: CoordinatorConfig,
}

impl ServerConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - `BIND_ADDR`: listen address (default: "0.0.0.0:8080")
    /// - `BASE_PUBLIC_URL`: public base URL (default: "http://localhost:8080")
    /// - `SIGN_SECRET`: callback signing secret (required)
    /// - `DATABASE_URL`: PostgreSQL URL (optional)
    /// - `TASK_QUEUE`: "local" (default) or "cloud-tasks"
    /// - `GCLOUD_PROJECT_ID`, `GCLOUD_LOCATION_ID`, `GCLOUD_TASKS_QUEUE`: required for cloud-tasks
    /// - `GCLOUD_ACCESS_TOKEN`: static token for cloud-tasks (optional)
    /// - `CORS_ALLOWED_ORIGINS`: comma-separated origins (optional)
    /// - `LOCK_LEASE_SECS`, `LOCK_MAX_ATTEMPTS`, `LOCK_BACKOFF_MS`: lease tuning
    /// - `RESUME_DELAY_MS`: delay of the fallback resume task
    /// - `RECORD_TRANSITIONS`: "true" to keep a transition log
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let sign_secret = var("SIGN_SECRET").ok_or(ConfigError::Missing("SIGN_SECRET"))?;

        let task_queue = match var("TASK_QUEUE").as_deref().unwrap_or("local") {
            "local" => TaskQueueBackend::Local,
            "cloud-tasks" => TaskQueueBackend::CloudTasks {
                project_id: var("GCLOUD_PROJECT_ID")
                    .ok_or(ConfigError::Missing("GCLOUD_PROJECT_ID"))?,
                location_id: var("GCLOUD_LOCATION_ID")
                    .ok_or(ConfigError::Missing("GCLOUD_LOCATION_ID"))?,
                queue: var("GCLOUD_TASKS_QUEUE")
                    .ok_or(ConfigError::Missing("GCLOUD_TASKS_QUEUE"))?,
                access_token: var("GCLOUD_ACCESS_TOKEN"),
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "TASK_QUEUE",
                    value: other.to_string(),
                    reason: "expected \"local\" or \"cloud-tasks\"".to_string(),
                })
            }
        };

        let mut lease = LeaseConfig::default();
        if let Some(secs) = parse_var::<u64>(&var, "LOCK_LEASE_SECS")? {
            if secs == 0 || secs > MAX_LEASE_DURATION.as_secs() {
                return Err(ConfigError::Invalid {
                    name: "LOCK_LEASE_SECS",
                    value: secs.to_string(),
                    reason: format!("expected 1 to {} seconds", MAX_LEASE_DURATION.as_secs()),
                });
            }
            lease = lease.with_lease_duration(Duration::from_secs(secs));
        }
        if let Some(attempts) = parse_var::<u32>(&var, "LOCK_MAX_ATTEMPTS")? {
            lease = lease.with_max_attempts(attempts);
        }
        if let Some(ms) = parse_var::<u64>(&var, "LOCK_BACKOFF_MS")? {
            lease = lease.with_backoff_step(Duration::from_millis(ms));
        }

        let mut coordinator = CoordinatorConfig::default();
        if let Some(ms) = parse_var::<u64>(&var, "RESUME_DELAY_MS")? {
            coordinator = coordinator.with_resume_delay(Duration::from_millis(ms));
        }
        if let Some(record) = var("RECORD_TRANSITIONS") {
            coordinator = coordinator.with_record_transitions(record.to_lowercase() == "true");
        }

        let cors_allowed_origins = var("CORS_ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            base_public_url: var("BASE_PUBLIC_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            sign_secret,
            database_url: var("DATABASE_URL"),
            task_queue,
            cors_allowed_origins,
            lease,
            coordinator,
        })
    }
}

fn parse_var<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
