//! Broker-management-API backed step queue.
//!
//! Talks to a message broker's HTTP management API (RabbitMQ-style):
//! publish through the default exchange, pull with acknowledge-on-get, and
//! read queue depth from the queue object. Deduplication is client-side
//! best-effort; the store's CAS transitions remain the correctness
//! backstop against double execution.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{EnqueueOptions, EnqueueResult, Envelope, QueueEntry, StepQueue};
use crate::error::{Error, Result};

/// Configuration for the broker queue client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Management API base URL (e.g. `http://broker:15672/api`).
    pub api_url: String,
    /// Virtual host.
    pub vhost: String,
    /// Queue name.
    pub queue: String,
    /// Basic-auth user.
    pub user: String,
    /// Basic-auth password.
    pub password: String,
    /// Request timeout.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl BrokerConfig {
    /// Creates a config with default credentials and timeout.
    #[must_use]
    pub fn new(api_url: impl Into<String>, vhost: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            vhost: vhost.into(),
            queue: queue.into(),
            user: "guest".to_string(),
            password: "guest".to_string(),
            timeout: default_timeout(),
        }
    }

    fn publish_url(&self) -> String {
        format!(
            "{}/exchanges/{}/amq.default/publish",
            self.api_url.trim_end_matches('/'),
            self.vhost
        )
    }

    fn get_url(&self) -> String {
        format!(
            "{}/queues/{}/{}/get",
            self.api_url.trim_end_matches('/'),
            self.vhost,
            self.queue
        )
    }

    fn queue_url(&self) -> String {
        format!(
            "{}/queues/{}/{}",
            self.api_url.trim_end_matches('/'),
            self.vhost,
            self.queue
        )
    }
}

#[derive(Debug, Serialize)]
struct PublishProperties {
    priority: u8,
    message_id: String,
}

#[derive(Debug, Serialize)]
struct PublishRequest {
    properties: PublishProperties,
    routing_key: String,
    payload: String,
    payload_encoding: &'static str,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    routed: bool,
}

#[derive(Debug, Serialize)]
struct GetRequest {
    count: u32,
    ackmode: &'static str,
    encoding: &'static str,
}

#[derive(Debug, Deserialize)]
struct GetProperties {
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetMessage {
    payload: String,
    #[serde(default)]
    properties: Option<GetProperties>,
}

#[derive(Debug, Deserialize)]
struct QueueInfo {
    #[serde(default)]
    messages: usize,
}

#[derive(Debug, Default)]
struct ClientState {
    seen_keys: HashMap<String, String>,
    consuming: bool,
}

/// Converts a lock poison error to a dispatch error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::dispatch("broker client state poisoned")
}

fn http_err(context: &str, e: reqwest::Error) -> Error {
    Error::dispatch(format!("{context}: {e}"))
}

/// [`StepQueue`] implementation over a broker management API.
pub struct BrokerStepQueue {
    config: BrokerConfig,
    client: reqwest::Client,
    state: RwLock<ClientState>,
}

impl BrokerStepQueue {
    /// Creates a broker queue client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| http_err("failed to build broker http client", e))?;
        Ok(Self {
            config,
            client,
            state: RwLock::new(ClientState {
                seen_keys: HashMap::new(),
                consuming: true,
            }),
        })
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[async_trait]
impl StepQueue for BrokerStepQueue {
    async fn enqueue(&self, envelope: Envelope, options: EnqueueOptions) -> Result<EnqueueResult> {
        let idempotency_key = envelope.idempotency_key();
        {
            let state = self.state.read().map_err(poison_err)?;
            if let Some(existing) = state.seen_keys.get(&idempotency_key) {
                return Ok(EnqueueResult::Deduplicated {
                    existing_message_id: existing.clone(),
                });
            }
        }

        let message_id = Ulid::new().to_string();
        let priority = options
            .priority
            .unwrap_or_else(|| envelope.default_priority().value());
        let routing_key = options
            .routing_key
            .unwrap_or_else(|| self.config.queue.clone());
        let payload = serde_json::to_string(&envelope).map_err(|e| Error::Serialization {
            message: format!("failed to serialize envelope: {e}"),
        })?;

        let request = PublishRequest {
            properties: PublishProperties {
                priority,
                message_id: message_id.clone(),
            },
            routing_key,
            payload,
            payload_encoding: "string",
        };

        let response: PublishResponse = self
            .client
            .post(self.config.publish_url())
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&request)
            .send()
            .await
            .map_err(|e| http_err("broker publish failed", e))?
            .error_for_status()
            .map_err(|e| http_err("broker publish rejected", e))?
            .json()
            .await
            .map_err(|e| http_err("broker publish response unreadable", e))?;

        if !response.routed {
            return Err(Error::dispatch(format!(
                "broker did not route message to queue {}",
                self.config.queue
            )));
        }

        let mut state = self.state.write().map_err(poison_err)?;
        state.seen_keys.insert(idempotency_key, message_id.clone());
        drop(state);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn take(&self) -> Result<Option<QueueEntry>> {
        {
            let state = self.state.read().map_err(poison_err)?;
            if !state.consuming {
                return Ok(None);
            }
        }

        let request = GetRequest {
            count: 1,
            ackmode: "ack_requeue_false",
            encoding: "auto",
        };

        let messages: Vec<GetMessage> = self
            .client
            .post(self.config.get_url())
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&request)
            .send()
            .await
            .map_err(|e| http_err("broker get failed", e))?
            .error_for_status()
            .map_err(|e| http_err("broker get rejected", e))?
            .json()
            .await
            .map_err(|e| http_err("broker get response unreadable", e))?;

        let Some(message) = messages.into_iter().next() else {
            return Ok(None);
        };

        let envelope: Envelope =
            serde_json::from_str(&message.payload).map_err(|e| Error::Serialization {
                message: format!("broker payload is not a dispatch envelope: {e}"),
            })?;
        let idempotency_key = envelope.idempotency_key();
        let properties = message.properties.unwrap_or(GetProperties {
            priority: None,
            message_id: None,
        });

        let mut state = self.state.write().map_err(poison_err)?;
        state.seen_keys.remove(&idempotency_key);
        drop(state);

        Ok(Some(QueueEntry {
            message_id: properties
                .message_id
                .unwrap_or_else(|| Ulid::new().to_string()),
            idempotency_key,
            priority: properties
                .priority
                .unwrap_or_else(|| envelope.default_priority().value()),
            envelope,
        }))
    }

    async fn queue_depth(&self) -> Result<usize> {
        let info: QueueInfo = self
            .client
            .get(self.config.queue_url())
            .basic_auth(&self.config.user, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| http_err("broker queue query failed", e))?
            .error_for_status()
            .map_err(|e| http_err("broker queue query rejected", e))?
            .json()
            .await
            .map_err(|e| http_err("broker queue response unreadable", e))?;
        Ok(info.messages)
    }

    async fn cancel_consumers(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.consuming = false;
        drop(state);
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.config.queue
    }
}
