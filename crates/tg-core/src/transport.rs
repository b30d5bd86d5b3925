//! Transport Client for the remote generation endpoint.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url, header};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::codec::RawPayload;
use crate::config::{GeneratorConfig, RetryConfig};
use crate::error::{SendFailure, TransportError};
use crate::request::OutboundRequest;

/// Successful transport outcome.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: RawPayload,
    /// Attempts across the generation request and any follow-up fetch
    pub attempts: u32,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `request` and resolve with image bytes, never a URL.
    async fn send(&self, request: OutboundRequest, cancel: CancelToken) -> Result<Delivery, SendFailure>;
}

/// Body of one HTTP exchange.
enum Reply {
    Binary(Bytes),
    Json(Value),
}

/// Image reference found in a JSON reply.
#[derive(Debug, PartialEq, Eq)]
enum Embedded {
    Base64(String),
    Url(String),
}

pub struct HttpTransport {
    client: Client,
    timeout: Duration,
    retry: RetryConfig,
}

impl HttpTransport {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("texgen/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::NetworkUnreachable(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            retry,
        })
    }

    pub fn from_config(config: &GeneratorConfig) -> Result<Self, TransportError> {
        Self::new(config.request_timeout, config.retry.clone())
    }

    async fn deliver(
        &self,
        request: OutboundRequest,
        cancel: &CancelToken,
        attempts: &mut u32,
    ) -> Result<RawPayload, TransportError> {
        let url = Url::parse(&request.url).map_err(|e| TransportError::MalformedUrl(e.to_string()))?;

        let reply = self
            .with_retry(cancel, attempts, || {
                let mut builder = self
                    .client
                    .request(request.method.clone(), url.clone())
                    .body(request.body.clone());
                for (name, value) in &request.headers {
                    builder = builder.header(name, value);
                }
                builder
            })
            .await?;

        let embedded = match reply {
            Reply::Binary(bytes) => return Ok(RawPayload::binary(bytes)),
            Reply::Json(value) => embedded_image(&value)?,
        };

        match embedded {
            Embedded::Base64(text) => Ok(RawPayload::base64(text)),
            Embedded::Url(location) => {
                let target = url
                    .join(&location)
                    .map_err(|e| TransportError::MalformedUrl(format!("{location}: {e}")))?;
                debug!("Fetching generated image from {}", target);

                match self
                    .with_retry(cancel, attempts, || self.client.get(target.clone()))
                    .await?
                {
                    Reply::Binary(bytes) => Ok(RawPayload::binary(bytes)),
                    Reply::Json(_) => Err(TransportError::InvalidResponse(
                        "image URL answered with JSON".into(),
                    )),
                }
            }
        }
    }

    /// Run attempts until success, a non-transient error, cancellation or exhaustion.
    async fn with_retry<F>(
        &self,
        cancel: &CancelToken,
        attempts: &mut u32,
        make_request: F,
    ) -> Result<Reply, TransportError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retry = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            *attempts += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                outcome = self.attempt(make_request()) => outcome,
            };

            let error = match outcome {
                Ok(reply) => return Ok(reply),
                Err(e) if !e.is_transient() || retry >= self.retry.max_retries => return Err(e),
                Err(e) => e,
            };

            retry += 1;
            let delay = error
                .retry_after()
                .map(|after| after.min(self.retry.max_backoff))
                .unwrap_or_else(|| self.retry.delay_for_retry(retry));
            warn!(
                "Request failed (attempt {}): {}; retrying in {:?}",
                *attempts, error, delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, request: reqwest::RequestBuilder) -> Result<Reply, TransportError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(Duration::from_secs(1), Duration::from_secs)
                .min(self.retry.max_backoff);
            return Err(TransportError::RateLimited {
                retry_after_ms: u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            });
        }
        if status.is_client_error() || status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), message));
        }
        if !status.is_success() {
            return Err(TransportError::InvalidResponse(format!("unexpected status {status}")));
        }

        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout))?;

        if is_json {
            serde_json::from_slice(&bytes)
                .map(Reply::Json)
                .map_err(|e| TransportError::InvalidResponse(format!("invalid JSON body: {e}")))
        } else {
            Ok(Reply::Binary(bytes))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest, cancel: CancelToken) -> Result<Delivery, SendFailure> {
        let mut attempts = 0;
        match self.deliver(request, &cancel, &mut attempts).await {
            Ok(payload) => Ok(Delivery { payload, attempts }),
            Err(error) => Err(SendFailure { error, attempts }),
        }
    }
}

fn embedded_image(value: &Value) -> Result<Embedded, TransportError> {
    let string = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);

    if let Some(data) = string(value.get("image"))
        .or_else(|| string(value.get("base64")))
        .or_else(|| string(value.pointer("/artifacts/0/base64")))
    {
        return Ok(Embedded::Base64(data));
    }
    if let Some(url) = string(value.get("url")).or_else(|| string(value.get("image_url"))) {
        return Ok(Embedded::Url(url));
    }

    Err(TransportError::InvalidResponse(
        "JSON body carries neither image data nor an image URL".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_embedded_shapes() {
        assert_eq!(
            embedded_image(&json!({"image": "AAAA", "finish_reason": "SUCCESS"})).unwrap(),
            Embedded::Base64("AAAA".into())
        );
        assert_eq!(
            embedded_image(&json!({"artifacts": [{"base64": "BBBB", "seed": 1}]})).unwrap(),
            Embedded::Base64("BBBB".into())
        );
        assert_eq!(
            embedded_image(&json!({"image_url": "/results/1.png"})).unwrap(),
            Embedded::Url("/results/1.png".into())
        );
    }

    #[test]
    fn test_embedded_missing() {
        assert!(matches!(
            embedded_image(&json!({"status": "ok"})),
            Err(TransportError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_url_fails_without_attempt() {
        let transport = HttpTransport::new(Duration::from_secs(1), RetryConfig::default()).unwrap();
        let request = OutboundRequest {
            method: reqwest::Method::POST,
            url: "not a url".into(),
            headers: Vec::new(),
            body: Bytes::new(),
        };
        let failure = transport.send(request, CancelToken::never()).await.unwrap_err();
        assert!(matches!(failure.error, TransportError::MalformedUrl(_)));
        assert_eq!(failure.attempts, 0);
    }
}
