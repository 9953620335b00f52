use http::Method;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl TransportErrorKind {
    /// Unknown host, refused connection and failed handshakes are worth another attempt.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Dns | Self::Connect | Self::Tls)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    Read,
    ResponseBody,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Read => "read",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HttpClientErrorCode {
    InvalidUri,
    MalformedRequest,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    ReadFile,
    PoolExhausted,
    PoolClosed,
    Transport,
    NoResponse,
    Timeout,
    ExecutionTimeout,
    ResponseTooLarge,
    ReadBody,
    RedirectLimitExceeded,
    CircularRedirect,
    InvalidRedirectLocation,
    UnknownCharset,
    Deserialize,
    TlsConfig,
    RuntimeUnavailable,
}

impl HttpClientErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::MalformedRequest => "malformed_request",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::ReadFile => "read_file",
            Self::PoolExhausted => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::Transport => "transport",
            Self::NoResponse => "no_response",
            Self::Timeout => "timeout",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ResponseTooLarge => "response_too_large",
            Self::ReadBody => "read_body",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::CircularRedirect => "circular_redirect",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::UnknownCharset => "unknown_charset",
            Self::Deserialize => "deserialize",
            Self::TlsConfig => "tls_config",
            Self::RuntimeUnavailable => "runtime_unavailable",
        }
    }
}

impl std::fmt::Display for HttpClientErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HttpClientError {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("malformed request {method} {uri}: {message}")]
    MalformedRequest {
        method: String,
        uri: String,
        message: String,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read multipart file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no pooled connection available for {route} within {timeout_ms}ms")]
    PoolExhausted { route: String, timeout_ms: u128 },
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("no http response received for {method} {uri}")]
    NoResponse {
        method: Method,
        uri: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("http request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http execution aborted after {timeout_ms}ms for {method} {uri}")]
    ExecutionTimeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseTooLarge {
        limit_bytes: usize,
        actual_bytes: u64,
        method: Method,
        uri: String,
    },
    #[error("failed to read response body for {method} {uri}: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("circular redirect to {location} for {method} {uri}")]
    CircularRedirect {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("unknown charset: {label}")]
    UnknownCharset { label: String },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("http client requires a running tokio runtime")]
    RuntimeUnavailable,
    #[error("http request {method} {uri} failed after {attempts} attempt(s): {source}")]
    RequestFailed {
        attempts: usize,
        method: Method,
        uri: String,
        #[source]
        source: Box<HttpClientError>,
    },
}

impl HttpClientError {
    /// Code of the underlying cause; a `RequestFailed` wrapper reports the code of what it wraps.
    pub fn code(&self) -> HttpClientErrorCode {
        match self {
            Self::InvalidUri { .. } => HttpClientErrorCode::InvalidUri,
            Self::MalformedRequest { .. } => HttpClientErrorCode::MalformedRequest,
            Self::InvalidHeaderName { .. } => HttpClientErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => HttpClientErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => HttpClientErrorCode::SerializeJson,
            Self::ReadFile { .. } => HttpClientErrorCode::ReadFile,
            Self::PoolExhausted { .. } => HttpClientErrorCode::PoolExhausted,
            Self::PoolClosed => HttpClientErrorCode::PoolClosed,
            Self::Transport { .. } => HttpClientErrorCode::Transport,
            Self::NoResponse { .. } => HttpClientErrorCode::NoResponse,
            Self::Timeout { .. } => HttpClientErrorCode::Timeout,
            Self::ExecutionTimeout { .. } => HttpClientErrorCode::ExecutionTimeout,
            Self::ResponseTooLarge { .. } => HttpClientErrorCode::ResponseTooLarge,
            Self::ReadBody { .. } => HttpClientErrorCode::ReadBody,
            Self::RedirectLimitExceeded { .. } => HttpClientErrorCode::RedirectLimitExceeded,
            Self::CircularRedirect { .. } => HttpClientErrorCode::CircularRedirect,
            Self::InvalidRedirectLocation { .. } => HttpClientErrorCode::InvalidRedirectLocation,
            Self::UnknownCharset { .. } => HttpClientErrorCode::UnknownCharset,
            Self::Deserialize { .. } => HttpClientErrorCode::Deserialize,
            Self::TlsConfig { .. } => HttpClientErrorCode::TlsConfig,
            Self::RuntimeUnavailable => HttpClientErrorCode::RuntimeUnavailable,
            Self::RequestFailed { source, .. } => source.code(),
        }
    }

    /// The innermost error, looking through a `RequestFailed` wrapper.
    pub fn cause(&self) -> &HttpClientError {
        match self {
            Self::RequestFailed { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Number of attempts made before this error was returned, when known.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::RequestFailed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Whether the execution supervisor retries an attempt that ended with this error.
    pub fn is_retryable(&self) -> bool {
        match self.cause() {
            Self::Transport { kind, .. } => kind.is_retryable(),
            Self::NoResponse { .. } => true,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// True for socket-level timeouts and for watchdog aborts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.cause(),
            Self::Timeout { .. } | Self::ExecutionTimeout { .. }
        )
    }
}
