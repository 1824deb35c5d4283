//! Google Cloud Tasks queue over the v2 REST API

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{QueuedTask, SchedulerError, TaskQueue};

const DEFAULT_ENDPOINT: &str = "https://cloudtasks.googleapis.com/v2";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Queue coordinates
#[derive(Debug, Clone)]
pub struct CloudTasksConfig {
    pub project_id: String,
    pub location_id: String,
    pub queue: String,

    /// API base URL (overridable for emulators)
    pub endpoint: String,
}

impl CloudTasksConfig {
    pub fn new(
        project_id: impl Into<String>,
        location_id: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            location_id: location_id.into(),
            queue: queue.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// `projects/{p}/locations/{l}/queues/{q}`
    pub fn queue_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.project_id, self.location_id, self.queue
        )
    }
}

/// Where bearer tokens come from
pub enum TokenSource {
    /// Fixed token, e.g. from `gcloud auth print-access-token`
    Static(String),

    /// GCE / Cloud Run metadata server, cached until shortly before expiry
    Metadata {
        cache: Mutex<Option<(String, Instant)>>,
    },
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl TokenSource {
    pub fn metadata() -> Self {
        Self::Metadata {
            cache: Mutex::new(None),
        }
    }

    async fn token(&self, client: &Client) -> Result<String, SchedulerError> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::Metadata { cache } => {
                let mut cache = cache.lock().await;
                if let Some((token, valid_until)) = cache.as_ref() {
                    if Instant::now() < *valid_until {
                        return Ok(token.clone());
                    }
                }

                let response = client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(SchedulerError::Auth(format!(
                        "metadata server returned {}",
                        response.status()
                    )));
                }

                let fetched: MetadataToken = response.json().await?;
                // Refresh a minute early
                let lifetime = Duration::from_secs(fetched.expires_in.saturating_sub(60));
                *cache = Some((fetched.access_token.clone(), Instant::now() + lifetime));
                debug!(expires_in = fetched.expires_in, "fetched access token");
                Ok(fetched.access_token)
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskBody {
    task: TaskBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskBody {
    schedule_time: String,
    http_request: HttpRequestBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequestBody {
    url: String,
    http_method: &'static str,
    headers: std::collections::HashMap<&'static str, &'static str>,
    body: String,
}

#[derive(Deserialize)]
struct CreatedTask {
    name: String,
}

fn create_body(task: &QueuedTask) -> CreateTaskBody {
    CreateTaskBody {
        task: TaskBody {
            schedule_time: task
                .schedule_time
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            http_request: HttpRequestBody {
                url: task.url.clone(),
                http_method: "POST",
                headers: [("Content-Type", "application/json")].into_iter().collect(),
                body: BASE64.encode(&task.body),
            },
        },
    }
}

/// Cloud Tasks backed queue
pub struct CloudTasksQueue {
    client: Client,
    config: CloudTasksConfig,
    tokens: TokenSource,
}

impl CloudTasksQueue {
    pub fn new(config: CloudTasksConfig, tokens: TokenSource) -> Self {
        Self::with_client(Client::new(), config, tokens)
    }

    pub fn with_client(client: Client, config: CloudTasksConfig, tokens: TokenSource) -> Self {
        Self {
            client,
            config,
            tokens,
        }
    }

    pub fn config(&self) -> &CloudTasksConfig {
        &self.config
    }
}

async fn api_error(response: reqwest::Response) -> SchedulerError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    SchedulerError::Queue(format!("Cloud Tasks returned {}: {}", status, text))
}

#[async_trait]
impl TaskQueue for CloudTasksQueue {
    #[instrument(skip(self, task), fields(url = %task.url))]
    async fn create_task(&self, task: QueuedTask) -> Result<String, SchedulerError> {
        let token = self.tokens.token(&self.client).await?;
        let url = format!("{}/{}/tasks", self.config.endpoint, self.config.queue_path());

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&create_body(&task))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let created: CreatedTask = response.json().await?;
        debug!(task = %created.name, "created cloud task");
        Ok(created.name)
    }

    #[instrument(skip(self))]
    async fn delete_task(&self, name: &str) -> Result<(), SchedulerError> {
        let token = self.tokens.token(&self.client).await?;
        let url = format!("{}/{}", self.config.endpoint, name);

        let response = self.client.delete(&url).bearer_auth(token).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("cloud task already gone");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }
}
