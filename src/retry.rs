use std::time::Duration;

use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::RequestConfig;
use crate::error::HttpClientError;
use crate::request::{PreparedRequest, RequestSpec};
use crate::response::HttpResponse;
use crate::transport::Transport;
use crate::util::redact_uri_for_logs;

/// Runs requests through a [`Transport`] with a flat-interval retry loop and
/// an optional wall-clock watchdog per attempt.
///
/// An attempt is retried when it fails with a retryable error (see
/// [`HttpClientError::is_retryable`]) or when it completes with a 4xx or 5xx
/// status. The method is not taken into account, so a retried `POST` may be
/// applied twice by the server. Once retries are exhausted the last response
/// is returned as is; if the last attempt failed the error is wrapped in
/// [`HttpClientError::RequestFailed`].
#[derive(Clone, Debug)]
pub struct ExecutionSupervisor<T> {
    transport: T,
}

impl<T: Transport> ExecutionSupervisor<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends with the retry count and interval of the request's own config.
    pub async fn send(&self, spec: RequestSpec) -> Result<HttpResponse, HttpClientError> {
        let retry_times = spec.request_config().retry_times;
        let retry_interval = spec.request_config().retry_interval;
        self.send_with(spec, retry_times, retry_interval).await
    }

    /// Makes at most `max_retries + 1` attempts, sleeping `retry_interval` between them.
    ///
    /// Errors raised while finalizing the request are returned before any
    /// attempt and are never wrapped.
    pub async fn send_with(
        &self,
        spec: RequestSpec,
        max_retries: usize,
        retry_interval: Duration,
    ) -> Result<HttpResponse, HttpClientError> {
        let config = spec.request_config().clone();
        let request = spec.finalize().await?;
        let max_attempts = max_retries.saturating_add(1);
        let redacted_uri = redact_uri_for_logs(request.url());

        let mut attempt = 1_usize;
        loop {
            let span = info_span!(
                "pooled_http.request",
                method = %request.method(),
                uri = %redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            let outcome = async {
                debug!("sending request");
                let outcome = self.attempt(&request, &config).await;
                if let Ok(response) = &outcome {
                    debug!(status = response.status_code(), "request completed");
                }
                outcome
            }
            .instrument(span.clone())
            .await;

            let retryable = match &outcome {
                Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
                Err(error) => error.is_retryable(),
            };
            if !retryable || attempt >= max_attempts {
                return outcome.map_err(|source| HttpClientError::RequestFailed {
                    attempts: attempt,
                    method: request.method().clone(),
                    uri: redacted_uri.clone(),
                    source: Box::new(source),
                });
            }

            span.in_scope(|| match &outcome {
                Ok(response) => warn!(
                    delay_ms = retry_interval.as_millis() as u64,
                    status = response.status_code(),
                    "retrying request after error status"
                ),
                Err(error) => warn!(
                    delay_ms = retry_interval.as_millis() as u64,
                    error = %error,
                    "retrying request after error"
                ),
            });
            drop(outcome);
            if !retry_interval.is_zero() {
                sleep(retry_interval).await;
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        request: &PreparedRequest,
        config: &RequestConfig,
    ) -> Result<HttpResponse, HttpClientError> {
        let exchange = async {
            let reply = self.transport.send(request, config).await?;
            HttpResponse::from_raw(reply, config).await
        };
        let Some(limit) = config.execution_timeout else {
            return exchange.await;
        };

        // Dropping the in-flight exchange closes its connection.
        tokio::select! {
            biased;
            _ = sleep(limit) => {
                warn!(timeout_ms = limit.as_millis() as u64, "execution watchdog aborted request");
                Err(HttpClientError::ExecutionTimeout {
                    timeout_ms: limit.as_millis(),
                    method: request.method().clone(),
                    uri: redact_uri_for_logs(request.url()),
                })
            }
            result = exchange => result,
        }
    }
}
