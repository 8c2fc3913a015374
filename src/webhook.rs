// SPDX-License-Identifier: MIT
//! Webhook delivery engine.
//!
//! Delivers JSON events to registered endpoints with an HMAC-SHA256 payload
//! signature. Retries are sequential with a fixed delay between attempts —
//! never concurrent. After the final attempt fails the event is routed to a
//! bounded in-memory dead-letter list where it can be inspected and requeued.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::telemetry::SharedCounters;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_HEADER: &str = "X-ShieldOps-Event";
pub const DELIVERY_HEADER: &str = "X-ShieldOps-Delivery";
pub const SIGNATURE_HEADER: &str = "X-ShieldOps-Signature";

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    /// Shared secret for payload signing. Never serialized.
    #[serde(skip_serializing, default)]
    pub secret: String,
}

/// Proof of a successful delivery.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub delivery_id: String,
    pub endpoint: String,
    pub event_type: String,
    /// Attempts it took (1 = first try succeeded).
    pub attempts: u32,
    pub delivered_at: DateTime<Utc>,
}

/// An event that exhausted its delivery attempts.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub endpoint: String,
    pub event_type: String,
    pub payload: Value,
    pub failure_reason: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown endpoint {0:?}")]
    UnknownEndpoint(String),
    #[error("endpoint {0:?} already registered")]
    DuplicateEndpoint(String),
    #[error("delivery to {endpoint} exhausted after {attempts} attempts: {reason} (dead-letter {dead_letter_id})")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        reason: String,
        dead_letter_id: String,
    },
    #[error("dead letter {0} not found")]
    DeadLetterNotFound(String),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ── Transport seam ───────────────────────────────────────────────────────────

/// How signed request bytes reach an endpoint. Production uses
/// [`HttpTransport`]; tests inject a scripted implementation.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST `body` to `url` with `headers`, returning the HTTP status code.
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> anyhow::Result<u16>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> anyhow::Result<u16> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        Ok(response.status().as_u16())
    }
}

// ── Signing ──────────────────────────────────────────────────────────────────

/// HMAC-SHA256 signature over the exact body bytes, formatted
/// `sha256=<hex digest>`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct WebhookDeliveryEngine {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    transport: Arc<dyn WebhookTransport>,
    config: WebhookConfig,
    counters: SharedCounters,
}

impl WebhookDeliveryEngine {
    pub fn new(config: WebhookConfig, counters: SharedCounters) -> anyhow::Result<Self> {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(
            config.request_timeout_secs,
        ))?);
        Ok(Self::with_transport(config, counters, transport))
    }

    pub fn with_transport(
        config: WebhookConfig,
        counters: SharedCounters,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            transport,
            config,
            counters,
        }
    }

    // ── Endpoint registry ────────────────────────────────────────────────────

    pub async fn register_endpoint(
        &self,
        name: &str,
        url: &str,
        secret: &str,
    ) -> Result<(), WebhookError> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(name) {
            return Err(WebhookError::DuplicateEndpoint(name.to_string()));
        }
        endpoints.insert(
            name.to_string(),
            Endpoint {
                name: name.to_string(),
                url: url.to_string(),
                secret: secret.to_string(),
            },
        );
        info!(endpoint = name, url, "webhook endpoint registered");
        Ok(())
    }

    pub async fn remove_endpoint(&self, name: &str) -> bool {
        self.endpoints.write().await.remove(name).is_some()
    }

    pub async fn list_endpoints(&self) -> Vec<Endpoint> {
        let mut list: Vec<Endpoint> = self.endpoints.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    // ── Delivery ─────────────────────────────────────────────────────────────

    /// Deliver `payload` to the named endpoint, retrying sequentially with a
    /// fixed delay. On exhaustion the event lands on the dead-letter list and
    /// the error carries the dead-letter id.
    pub async fn deliver(
        &self,
        endpoint_name: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<DeliveryReceipt, WebhookError> {
        let endpoint = self
            .endpoints
            .read()
            .await
            .get(endpoint_name)
            .cloned()
            .ok_or_else(|| WebhookError::UnknownEndpoint(endpoint_name.to_string()))?;

        let max_attempts = self.config.max_attempts.max(1);
        match self
            .attempt_delivery(&endpoint, event_type, payload, max_attempts)
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(reason) => {
                let dead_letter_id = self
                    .push_dead_letter(&endpoint.name, event_type, payload, &reason, max_attempts)
                    .await;
                Err(WebhookError::Exhausted {
                    endpoint: endpoint.name,
                    attempts: max_attempts,
                    reason,
                    dead_letter_id,
                })
            }
        }
    }

    /// The retry loop. Returns the failure reason of the last attempt on
    /// exhaustion.
    async fn attempt_delivery(
        &self,
        endpoint: &Endpoint,
        event_type: &str,
        payload: &Value,
        max_attempts: u32,
    ) -> Result<DeliveryReceipt, String> {
        let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;
        let delivery_id = Uuid::new_v4().to_string();
        // Signature covers the exact bytes sent.
        let signature = sign_payload(&endpoint.secret, &body);
        let headers = vec![
            (EVENT_HEADER.to_string(), event_type.to_string()),
            (DELIVERY_HEADER.to_string(), delivery_id.clone()),
            (SIGNATURE_HEADER.to_string(), signature),
        ];

        let mut last_failure = String::new();
        for attempt in 1..=max_attempts {
            match self.transport.post(&endpoint.url, &headers, &body).await {
                Ok(status) if (200..300).contains(&status) => {
                    self.counters.inc_webhooks_delivered();
                    debug!(
                        endpoint = %endpoint.name,
                        event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        "webhook delivered"
                    );
                    return Ok(DeliveryReceipt {
                        delivery_id,
                        endpoint: endpoint.name.clone(),
                        event_type: event_type.to_string(),
                        attempts: attempt,
                        delivered_at: Utc::now(),
                    });
                }
                Ok(status) => {
                    last_failure = format!("endpoint returned HTTP {status}");
                }
                Err(e) => {
                    last_failure = format!("transport error: {e:#}");
                }
            }
            if attempt < max_attempts {
                warn!(
                    endpoint = %endpoint.name,
                    event_type,
                    attempt,
                    max = max_attempts,
                    reason = %last_failure,
                    "webhook delivery failed — retrying"
                );
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }
        Err(last_failure)
    }

    // ── Dead letters ─────────────────────────────────────────────────────────

    async fn push_dead_letter(
        &self,
        endpoint: &str,
        event_type: &str,
        payload: &Value,
        reason: &str,
        attempts: u32,
    ) -> String {
        let letter = DeadLetter {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            failure_reason: reason.to_string(),
            attempts,
            created_at: Utc::now(),
        };
        let id = letter.id.clone();

        let mut letters = self.dead_letters.lock().await;
        if letters.len() >= self.config.dead_letter_max.max(1) {
            letters.pop_front();
        }
        letters.push_back(letter);
        drop(letters);

        self.counters.inc_webhooks_dead_lettered();
        warn!(
            endpoint,
            event_type,
            dead_letter_id = %id,
            reason,
            "webhook delivery exhausted — dead-lettered"
        );
        id
    }

    /// Dead letters, oldest first.
    pub async fn list_dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }

    /// Re-attempt a dead-lettered event with a single delivery attempt — no
    /// retry loop. On success the letter is dropped; on failure a fresh
    /// letter with the updated reason replaces it.
    pub async fn requeue_dead_letter(
        &self,
        id: &str,
    ) -> Result<DeliveryReceipt, WebhookError> {
        let letter = {
            let mut letters = self.dead_letters.lock().await;
            let pos = letters
                .iter()
                .position(|l| l.id == id)
                .ok_or_else(|| WebhookError::DeadLetterNotFound(id.to_string()))?;
            letters.remove(pos).expect("position is in range")
        };

        info!(dead_letter_id = id, endpoint = %letter.endpoint, "requeueing dead letter");
        let endpoint = self.endpoints.read().await.get(&letter.endpoint).cloned();
        let Some(endpoint) = endpoint else {
            // Endpoint was removed since the failure; keep the letter around.
            let name = letter.endpoint.clone();
            self.dead_letters.lock().await.push_back(letter);
            return Err(WebhookError::UnknownEndpoint(name));
        };

        match self
            .attempt_delivery(&endpoint, &letter.event_type, &letter.payload, 1)
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(reason) => {
                let dead_letter_id = self
                    .push_dead_letter(
                        &endpoint.name,
                        &letter.event_type,
                        &letter.payload,
                        &reason,
                        letter.attempts + 1,
                    )
                    .await;
                Err(WebhookError::Exhausted {
                    endpoint: endpoint.name,
                    attempts: 1,
                    reason,
                    dead_letter_id,
                })
            }
        }
    }

    pub async fn clear_dead_letters(&self) -> usize {
        let mut letters = self.dead_letters.lock().await;
        let n = letters.len();
        letters.clear();
        n
    }
}
