use std::time::Duration;

use bytes::Bytes;
use encoding_rs::Encoding;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::de::DeserializeOwned;

use crate::charset::{decode, resolve_charset};
use crate::config::RequestConfig;
use crate::error::{HttpClientError, TimeoutPhase};
use crate::transport::{RawReply, ReplyBody, allows_reuse, keep_alive_hint};
use crate::util::{redact_uri_for_logs, truncate_body};

enum ReadBodyError {
    Read(hyper::Error),
    TooLarge { actual_bytes: usize },
    TimedOut,
}

/// Reads every frame, failing once more than `max_bytes` arrived or a frame
/// takes longer than `frame_timeout`.
async fn read_all_body_limited(
    mut body: Incoming,
    max_bytes: usize,
    frame_timeout: Duration,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    loop {
        let frame = match tokio::time::timeout(frame_timeout, body.frame()).await {
            Err(_) => return Err(ReadBodyError::TimedOut),
            Ok(None) => break,
            Ok(Some(frame)) => frame.map_err(ReadBodyError::Read)?,
        };
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}

fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// HEAD replies and 1xx, 204 and 304 statuses never carry a body, whatever
/// their `Content-Length` says.
fn may_carry_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// A completed response with its body fully buffered.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    method: Method,
    status: StatusCode,
    reason: String,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    charset: &'static Encoding,
    last_request_url: String,
}

impl HttpResponse {
    /// Consumes the reply body within the configured cap and hands the
    /// connection back to its pool when it can carry another exchange.
    ///
    /// A declared `Content-Length` above the cap fails before any body byte
    /// is read. Bodyless replies skip the cap and read nothing. On every
    /// error path the connection is closed.
    pub async fn from_raw(raw: RawReply, config: &RequestConfig) -> Result<Self, HttpClientError> {
        let RawReply {
            method,
            status,
            reason,
            version,
            headers,
            body,
            lease,
            last_request_url,
        } = raw;
        let limit_bytes = config.max_response_body_bytes;
        let has_body = may_carry_body(&method, status);
        let body = if has_body {
            body
        } else {
            ReplyBody::Buffered(Bytes::new())
        };

        if has_body
            && let Some(declared) = declared_content_length(&headers)
            && declared > limit_bytes as u64
        {
            return Err(HttpClientError::ResponseTooLarge {
                limit_bytes,
                actual_bytes: declared,
                method,
                uri: redact_uri_for_logs(&last_request_url),
            });
        }

        let body = match body {
            ReplyBody::Buffered(bytes) if bytes.len() > limit_bytes => {
                return Err(HttpClientError::ResponseTooLarge {
                    limit_bytes,
                    actual_bytes: bytes.len() as u64,
                    method,
                    uri: redact_uri_for_logs(&last_request_url),
                });
            }
            ReplyBody::Buffered(bytes) => bytes,
            ReplyBody::Streaming(incoming) => {
                match read_all_body_limited(incoming, limit_bytes, config.socket_timeout).await {
                    Ok(bytes) => bytes,
                    Err(ReadBodyError::TooLarge { actual_bytes }) => {
                        return Err(HttpClientError::ResponseTooLarge {
                            limit_bytes,
                            actual_bytes: actual_bytes as u64,
                            method,
                            uri: redact_uri_for_logs(&last_request_url),
                        });
                    }
                    Err(ReadBodyError::TimedOut) => {
                        return Err(HttpClientError::Timeout {
                            phase: TimeoutPhase::ResponseBody,
                            timeout_ms: config.socket_timeout.as_millis(),
                            method,
                            uri: redact_uri_for_logs(&last_request_url),
                        });
                    }
                    Err(ReadBodyError::Read(source)) => {
                        return Err(HttpClientError::ReadBody {
                            method,
                            uri: redact_uri_for_logs(&last_request_url),
                            source: Box::new(source),
                        });
                    }
                }
            }
        };

        if let Some(lease) = lease
            && allows_reuse(version, &headers)
        {
            lease.release(keep_alive_hint(&headers));
        }

        let charset = resolve_charset(
            headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            &body,
            config.inspect_html_charset,
            config.response_charset,
        );

        Ok(Self {
            method,
            status,
            reason,
            version,
            headers,
            body,
            charset,
            last_request_url,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Method of the last request sent, after any redirect rewrote it.
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    pub fn last_header(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .next_back()
    }

    pub fn headers_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect()
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// Charset picked by the header, HTML meta, default cascade.
    pub fn charset(&self) -> &'static Encoding {
        self.charset
    }

    pub fn text(&self) -> String {
        decode(&self.body, self.charset)
    }

    /// Decodes with an explicit charset label; an empty label uses [`HttpResponse::charset`].
    pub fn text_with_charset(&self, label: &str) -> Result<String, HttpClientError> {
        let label = label.trim();
        if label.is_empty() {
            return Ok(self.text());
        }
        let encoding =
            Encoding::for_label(label.as_bytes()).ok_or_else(|| HttpClientError::UnknownCharset {
                label: label.to_owned(),
            })?;
        Ok(decode(&self.body, encoding))
    }

    pub fn json<T>(&self) -> Result<T, HttpClientError>
    where
        T: DeserializeOwned,
    {
        let text = self.text();
        serde_json::from_str(&text).map_err(|source| HttpClientError::Deserialize {
            source,
            body: truncate_body(text.as_bytes()),
        })
    }

    /// URL of the last request sent, after redirects.
    pub fn last_request_url(&self) -> &str {
        &self.last_request_url
    }
}
