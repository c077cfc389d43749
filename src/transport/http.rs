use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{classify_reqwest, classify_status, retry_after_ms};
use crate::drivers::DriverRequest;
use crate::{BoxStream, Error, Result};

/// Upper bound on how much of an error body ends up in an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Timeouts applied by one provider's transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    /// Total deadline for non-streaming calls. Streams are bounded by the
    /// idle-chunk timeout instead.
    pub request_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Thin reqwest wrapper shared by every HTTP-based adapter.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    settings: TransportSettings,
}

impl HttpTransport {
    pub fn new(settings: TransportSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::UpstreamConnection {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> TransportSettings {
        self.settings
    }

    /// Send `request` and return the response once its status is known to be
    /// a success. Cancelling `cancel` aborts the in-flight call.
    pub async fn send(
        &self,
        request: &DriverRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut req = self
            .client
            .post(&request.url)
            .json(&request.body)
            .header("x-request-id", &request_id);
        for (k, v) in &request.headers {
            req = req.header(k, v);
        }
        req = if request.stream {
            req.header("accept", "text/event-stream")
        } else {
            req.header("accept", "application/json")
                .timeout(self.settings.request_timeout)
        };

        tracing::debug!(url = %request.url, request_id = %request_id, stream = request.stream, "sending upstream request");

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = req.send() => r.map_err(classify_reqwest)?,
        };

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = retry_after_ms(resp.headers());
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            b = resp.text() => b.unwrap_or_default(),
        };
        let message: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        tracing::debug!(http_status = status.as_u16(), request_id = %request_id, "upstream returned an error status");
        Err(classify_status(status.as_u16(), retry_after, message))
    }

    /// Send a non-streaming request and decode its JSON body.
    pub async fn send_json(
        &self,
        request: &DriverRequest,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let resp = self.send(request, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            v = resp.json::<Value>() => v.map_err(classify_reqwest),
        }
    }

    /// Body of a successful streaming response as a chunk stream.
    pub fn byte_stream(resp: reqwest::Response) -> BoxStream<'static, bytes::Bytes> {
        Box::pin(resp.bytes_stream().map(|r| r.map_err(classify_reqwest)))
    }
}
