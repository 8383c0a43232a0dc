// HTTP implementation of the gateway API
// Authenticated JSON requests against one base URL

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Method, Url};
use serde_json::{json, Value};
use std::time::Duration;

use super::payloads;
use super::{
    paths, ChatEntry, GatewayApi, GatewayError, MessageRecord, PairingTicket, RawInstance,
    SendReceipt, API_KEY_HEADER,
};

/// Bounded retry for read-only calls.
///
/// Writes (create, connect, delete, send) always get exactly one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1, base_backoff: Duration::from_millis(500) }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

pub struct GatewayClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    retry: RetryPolicy,
}

impl GatewayClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| GatewayError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy { max_attempts: retry.max_attempts.max(1), ..retry };
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Build `<base><path>[/<name>]`, pushing the instance name as one encoded segment.
    fn endpoint(&self, path: &str, name: Option<&str>) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| GatewayError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
            if let Some(name) = name {
                segments.push(name);
            }
        }
        Ok(url)
    }

    async fn request_once(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let path = url.path().to_string();
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(API_KEY_HEADER, &self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!("{} {}", method, path);
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(GatewayError::Status { status: status.as_u16(), path, body: text });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::Decode { path, reason: e.to_string() })
    }

    /// Read-only request, retried per the policy.
    async fn read(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value, GatewayError> {
        let mut attempt = 1;
        loop {
            match self.request_once(method.clone(), url.clone(), body).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        "Gateway read {} failed (attempt {}/{}): {}; retrying in {:?}",
                        url.path(),
                        attempt,
                        self.retry.max_attempts,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn list(path: &str, value: Value) -> Result<Vec<Value>, GatewayError> {
        payloads::unwrap_list(value).ok_or_else(|| GatewayError::Decode {
            path: path.to_string(),
            reason: "expected a list or a wrapped list".to_string(),
        })
    }
}

#[async_trait]
impl GatewayApi for GatewayClient {
    async fn fetch_instances(&self) -> Result<Vec<RawInstance>, GatewayError> {
        let url = self.endpoint(paths::FETCH_INSTANCES, None)?;
        let value = self.read(Method::GET, url, None).await?;
        let entries = Self::list(paths::FETCH_INSTANCES, value)?;

        let instances: Vec<RawInstance> = entries.iter().filter_map(payloads::parse_instance).collect();
        if instances.len() < entries.len() {
            warn!("Skipped {} instance entries without a name", entries.len() - instances.len());
        }
        Ok(instances)
    }

    async fn create_instance(&self, name: &str) -> Result<PairingTicket, GatewayError> {
        let url = self.endpoint(paths::CREATE_INSTANCE, None)?;
        let body = json!({
            "instanceName": name,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });
        info!("Creating gateway instance {}", name);
        let value = self.request_once(Method::POST, url, Some(&body)).await?;
        Ok(payloads::parse_pairing(&value))
    }

    async fn connect_instance(&self, name: &str) -> Result<PairingTicket, GatewayError> {
        let url = self.endpoint(paths::CONNECT_INSTANCE, Some(name))?;
        let value = self.request_once(Method::GET, url, None).await?;
        Ok(payloads::parse_pairing(&value))
    }

    async fn delete_instance(&self, name: &str) -> Result<(), GatewayError> {
        let url = self.endpoint(paths::DELETE_INSTANCE, Some(name))?;
        info!("Deleting gateway instance {}", name);
        self.request_once(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn find_chats(&self, instance: &str) -> Result<Vec<ChatEntry>, GatewayError> {
        let url = self.endpoint(paths::FIND_CHATS, Some(instance))?;
        let value = self.read(Method::POST, url, Some(&json!({}))).await?;
        let entries = Self::list(paths::FIND_CHATS, value)?;
        Ok(entries.iter().map(payloads::parse_chat).collect())
    }

    async fn fetch_messages(
        &self,
        instance: &str,
        remote_jid: &str,
        count: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError> {
        let url = self.endpoint(paths::FETCH_MESSAGES, Some(instance))?;
        let body = json!({
            "where": { "key": { "remoteJid": remote_jid } },
            "limit": count,
        });
        let value = self.read(Method::POST, url, Some(&body)).await?;
        let entries = Self::list(paths::FETCH_MESSAGES, value)?;
        Ok(entries.iter().map(payloads::parse_message).collect())
    }

    async fn send_text(
        &self,
        instance: &str,
        remote_jid: &str,
        text: &str,
    ) -> Result<SendReceipt, GatewayError> {
        let url = self.endpoint(paths::SEND_TEXT, Some(instance))?;
        let body = json!({ "number": remote_jid, "text": text });
        let value = self.request_once(Method::POST, url, Some(&body)).await?;
        Ok(payloads::parse_send_receipt(&value))
    }
}
