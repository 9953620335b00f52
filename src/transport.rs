use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, COOKIE, HOST, HeaderValue};
use http::{HeaderMap, Method, Request, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use tracing::debug;

use crate::config::{CookieSpec, RequestConfig};
use crate::connect::{ConnectFailure, Connector, Route};
use crate::cookies::CookieJar;
use crate::error::{HttpClientError, TimeoutPhase};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::request::PreparedRequest;
use crate::util::{
    classify_exchange_error, is_redirect_status, is_redirectable_method, redact_uri_for_logs,
    redirect_location, redirect_method, resolve_redirect_uri, same_origin,
    sanitize_headers_for_redirect,
};

const MAX_DRAINED_REDIRECT_BODY: usize = 64 * 1024;

pub(crate) enum ReplyBody {
    Buffered(Bytes),
    Streaming(Incoming),
}

/// Status line, headers and a not yet consumed body of one exchange.
///
/// When the body is streamed from a pooled connection the reply also owns
/// the connection lease; building an [`crate::HttpResponse`] from it consumes
/// the body and hands the connection back or closes it.
pub struct RawReply {
    pub(crate) method: Method,
    pub(crate) status: StatusCode,
    pub(crate) reason: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: ReplyBody,
    pub(crate) lease: Option<PooledConnection>,
    pub(crate) last_request_url: String,
}

impl std::fmt::Debug for RawReply {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RawReply")
            .field("method", &self.method)
            .field("status", &self.status)
            .field("last_request_url", &self.last_request_url)
            .finish_non_exhaustive()
    }
}

impl RawReply {
    /// A reply whose body is already in memory, for custom transports.
    pub fn buffered(
        method: Method,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
        last_request_url: impl Into<String>,
    ) -> Self {
        Self {
            method,
            status,
            reason: status.canonical_reason().unwrap_or_default().to_owned(),
            version: Version::HTTP_11,
            headers,
            body: ReplyBody::Buffered(body.into()),
            lease: None,
            last_request_url: last_request_url.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// One physical send/receive, redirects included. Retries and the execution
/// watchdog are layered on top by [`crate::ExecutionSupervisor`].
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: &PreparedRequest,
        config: &RequestConfig,
    ) -> impl Future<Output = Result<RawReply, HttpClientError>> + Send;
}

/// `Connection: close` or HTTP/1.0 without keep-alive ends the connection after this exchange.
pub(crate) fn allows_reuse(version: Version, headers: &HeaderMap) -> bool {
    let tokens = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();
    if tokens.iter().any(|token| token == "close") {
        return false;
    }
    version >= Version::HTTP_11 || tokens.iter().any(|token| token == "keep-alive")
}

/// `timeout=N` from a `Keep-Alive` response header.
pub(crate) fn keep_alive_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all("keep-alive")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|param| {
            let (name, value) = param.split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("timeout") {
                return None;
            }
            value.trim().parse::<u64>().ok().map(Duration::from_secs)
        })
}

/// Pool-backed HTTP/1.1 transport with lax redirect handling and a shared cookie jar.
#[derive(Clone)]
pub struct HyperTransport {
    pool: ConnectionPool,
    connector: Connector,
    cookies: CookieJar,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

struct Hop<'a> {
    method: &'a Method,
    uri: &'a Uri,
    uri_text: &'a str,
    headers: &'a HeaderMap,
    body: &'a Bytes,
}

impl HyperTransport {
    pub fn new(pool: ConnectionPool, cookies: CookieJar) -> Result<Self, HttpClientError> {
        let connector = Connector::new(pool.config().tls_trust)?;
        Ok(Self {
            pool,
            connector,
            cookies,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    async fn execute(
        &self,
        request: &PreparedRequest,
        config: &RequestConfig,
    ) -> Result<RawReply, HttpClientError> {
        let policy = config.redirect_policy;
        let mut method = request.method().clone();
        let mut uri = request.uri().clone();
        let mut uri_text = uri.to_string();
        let mut headers = request.headers().clone();
        let mut body = request.body().clone();
        let mut visited = HashSet::from([uri_text.clone()]);
        let mut redirects = 0_usize;

        loop {
            let hop = Hop {
                method: &method,
                uri: &uri,
                uri_text: &uri_text,
                headers: &headers,
                body: &body,
            };
            let (response, lease) = self.exchange(&hop, config).await?;
            let (parts, incoming) = response.into_parts();
            if config.cookie_spec == CookieSpec::Standard
                && let Ok(url) = url::Url::parse(&uri_text)
            {
                self.cookies.store_from_headers(&parts.headers, &url);
            }

            let location = redirect_location(&parts.headers);
            let follow = policy.is_enabled()
                && is_redirect_status(parts.status)
                && is_redirectable_method(&method);
            let Some(location) = location.filter(|_| follow) else {
                let reason = parts
                    .extensions
                    .get::<hyper::ext::ReasonPhrase>()
                    .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
                    .unwrap_or_else(|| {
                        parts
                            .status
                            .canonical_reason()
                            .unwrap_or_default()
                            .to_owned()
                    });
                return Ok(RawReply {
                    method,
                    status: parts.status,
                    reason,
                    version: parts.version,
                    headers: parts.headers,
                    body: ReplyBody::Streaming(incoming),
                    lease: Some(lease),
                    last_request_url: uri_text,
                });
            };

            if redirects >= policy.max_redirects() {
                return Err(HttpClientError::RedirectLimitExceeded {
                    max_redirects: policy.max_redirects(),
                    method,
                    uri: redact_uri_for_logs(request.uri().to_string().as_str()),
                });
            }
            let Some(next_uri) = resolve_redirect_uri(&uri, &location) else {
                return Err(HttpClientError::InvalidRedirectLocation {
                    location,
                    method,
                    uri: redact_uri_for_logs(&uri_text),
                });
            };
            let next_text = next_uri.to_string();
            if !visited.insert(next_text.clone()) && !policy.allows_circular() {
                return Err(HttpClientError::CircularRedirect {
                    location: redact_uri_for_logs(&next_text),
                    method,
                    uri: redact_uri_for_logs(&uri_text),
                });
            }

            let reusable = allows_reuse(parts.version, &parts.headers);
            drain_and_release(incoming, lease, reusable, keep_alive_hint(&parts.headers), config)
                .await;

            let next_method = redirect_method(&method, parts.status);
            let changed_to_get = next_method == Method::GET && method != Method::GET;
            if changed_to_get {
                body = Bytes::new();
            }
            sanitize_headers_for_redirect(&mut headers, changed_to_get, same_origin(&uri, &next_uri));
            debug!(
                status = parts.status.as_u16(),
                from = %redact_uri_for_logs(&uri_text),
                to = %redact_uri_for_logs(&next_text),
                "following redirect"
            );
            method = next_method;
            uri = next_uri;
            uri_text = next_text;
            redirects += 1;
        }
    }

    async fn exchange(
        &self,
        hop: &Hop<'_>,
        config: &RequestConfig,
    ) -> Result<(http::Response<Incoming>, PooledConnection), HttpClientError> {
        let route = Route::from_uri(hop.uri, config.proxy.as_ref())?;
        let mut lease = self
            .pool
            .acquire(&route, config.connection_request_timeout)
            .await?;

        if lease.is_reused() {
            match self.send_on(&mut lease, hop, config).await {
                Ok(response) => return Ok((response, lease)),
                Err(error) if is_stale_connection(&error) => {
                    debug!(route = %route, "reused connection was stale, reconnecting");
                    drop(lease);
                    lease = self
                        .pool
                        .acquire(&route, config.connection_request_timeout)
                        .await?;
                }
                Err(error) => return Err(to_client_error(error, hop, config)),
            }
        }

        if lease.connection().is_none() {
            let connection = self
                .connector
                .connect(&route, config.connect_timeout)
                .await
                .map_err(|failure| match failure {
                    ConnectFailure::TimedOut => HttpClientError::Timeout {
                        phase: TimeoutPhase::Connect,
                        timeout_ms: config.connect_timeout.as_millis(),
                        method: hop.method.clone(),
                        uri: redact_uri_for_logs(hop.uri_text),
                    },
                    ConnectFailure::Failed { kind, source } => HttpClientError::Transport {
                        kind,
                        method: hop.method.clone(),
                        uri: redact_uri_for_logs(hop.uri_text),
                        source,
                    },
                })?;
            lease.attach(connection);
        }

        match self.send_on(&mut lease, hop, config).await {
            Ok(response) => Ok((response, lease)),
            Err(error) => Err(to_client_error(error, hop, config)),
        }
    }

    async fn send_on(
        &self,
        lease: &mut PooledConnection,
        hop: &Hop<'_>,
        config: &RequestConfig,
    ) -> Result<http::Response<Incoming>, ExchangeError> {
        let Some(connection) = lease.connection_mut() else {
            return Err(ExchangeError::Closed);
        };
        let target = if connection.uses_absolute_form() {
            hop.uri.clone()
        } else {
            origin_form(hop.uri)
        };

        let mut headers = hop.headers.clone();
        if !headers.contains_key(HOST)
            && let Some(host) = host_header(hop.uri)
        {
            headers.insert(HOST, host);
        }
        if config.cookie_spec == CookieSpec::Standard
            && let Ok(url) = url::Url::parse(hop.uri_text)
            && let Some(jar_cookies) = self.cookies.header_for(&url)
        {
            let merged = match headers.get(COOKIE).and_then(|value| value.to_str().ok()) {
                Some(existing) => HeaderValue::from_str(&format!(
                    "{existing}; {}",
                    jar_cookies.to_str().unwrap_or_default()
                ))
                .unwrap_or(jar_cookies),
                None => jar_cookies,
            };
            headers.insert(COOKIE, merged);
        }

        let mut request = Request::builder()
            .method(hop.method.clone())
            .uri(target)
            .body(Full::new(hop.body.clone()))
            .map_err(ExchangeError::Build)?;
        *request.headers_mut() = headers;

        let sender = connection.sender();
        let exchange = async {
            sender.ready().await?;
            sender.send_request(request).await
        };
        match tokio::time::timeout(config.socket_timeout, exchange).await {
            Err(_) => Err(ExchangeError::TimedOut),
            Ok(Err(error)) => Err(ExchangeError::Hyper(error)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        request: &PreparedRequest,
        config: &RequestConfig,
    ) -> impl Future<Output = Result<RawReply, HttpClientError>> + Send {
        self.execute(request, config)
    }
}

#[derive(Debug)]
enum ExchangeError {
    Closed,
    TimedOut,
    Build(http::Error),
    Hyper(hyper::Error),
}

fn is_stale_connection(error: &ExchangeError) -> bool {
    match error {
        ExchangeError::Closed => true,
        ExchangeError::Hyper(error) => {
            error.is_closed() || error.is_canceled() || error.is_incomplete_message()
        }
        ExchangeError::TimedOut | ExchangeError::Build(_) => false,
    }
}

fn to_client_error(error: ExchangeError, hop: &Hop<'_>, config: &RequestConfig) -> HttpClientError {
    let uri = redact_uri_for_logs(hop.uri_text);
    let method = hop.method.clone();
    match error {
        ExchangeError::Closed => HttpClientError::NoResponse {
            method,
            uri,
            source: None,
        },
        ExchangeError::TimedOut => HttpClientError::Timeout {
            phase: TimeoutPhase::Read,
            timeout_ms: config.socket_timeout.as_millis(),
            method,
            uri,
        },
        ExchangeError::Build(source) => HttpClientError::MalformedRequest {
            method: method.to_string(),
            uri,
            message: source.to_string(),
        },
        ExchangeError::Hyper(source)
            if source.is_closed() || source.is_canceled() || source.is_incomplete_message() =>
        {
            HttpClientError::NoResponse {
                method,
                uri,
                source: Some(Box::new(source)),
            }
        }
        ExchangeError::Hyper(source) => HttpClientError::Transport {
            kind: classify_exchange_error(&source),
            method,
            uri,
            source: Box::new(source),
        },
    }
}

fn origin_form(uri: &Uri) -> Uri {
    let path = uri
        .path_and_query()
        .map(|path| path.as_str())
        .filter(|path| !path.is_empty())
        .unwrap_or("/");
    path.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

fn host_header(uri: &Uri) -> Option<HeaderValue> {
    let authority = uri.authority()?;
    let host = authority.host();
    let text = match (authority.port_u16(), uri.scheme_str()) {
        (Some(80), Some("http")) | (Some(443), Some("https")) | (None, _) => host.to_owned(),
        (Some(port), _) => format!("{host}:{port}"),
    };
    HeaderValue::from_str(&text).ok()
}

async fn drain_and_release(
    mut incoming: Incoming,
    lease: PooledConnection,
    reusable: bool,
    keep_alive: Option<Duration>,
    config: &RequestConfig,
) {
    if !reusable {
        return;
    }
    let drained = tokio::time::timeout(config.socket_timeout, async {
        let mut seen = 0_usize;
        while let Some(frame) = incoming.frame().await {
            let frame = frame.ok()?;
            if let Some(data) = frame.data_ref() {
                seen = seen.saturating_add(data.len());
                if seen > MAX_DRAINED_REDIRECT_BODY {
                    return None;
                }
            }
        }
        Some(())
    })
    .await;
    if matches!(drained, Ok(Some(()))) {
        lease.release(keep_alive);
    }
}
