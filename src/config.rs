use std::time::Duration;

use encoding_rs::{Encoding, UTF_8};

use crate::tls::TlsTrust;

pub(crate) const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(45);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_CONNECTION_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 100_000_000;
pub(crate) const DEFAULT_MAX_REDIRECTS: usize = 20;
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 200;
pub(crate) const DEFAULT_MAX_CONNECTIONS_PER_ROUTE: usize = 100;
pub(crate) const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(90);
pub(crate) const DEFAULT_REAPER_INITIAL_DELAY: Duration = Duration::from_secs(90);
pub(crate) const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(30);

pub const USER_AGENT_CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/84.0.4147.105 Safari/537.36";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    circular_allowed: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    pub const fn none() -> Self {
        Self {
            enabled: false,
            circular_allowed: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            circular_allowed: false,
            max_redirects,
        }
    }

    pub const fn circular_allowed(mut self, circular_allowed: bool) -> Self {
        self.circular_allowed = circular_allowed;
        self
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled && self.max_redirects > 0
    }

    pub const fn allows_circular(&self) -> bool {
        self.circular_allowed
    }

    pub const fn max_redirects(&self) -> usize {
        self.max_redirects
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::limited(DEFAULT_MAX_REDIRECTS)
    }
}

/// How the client-scoped cookie jar participates in a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CookieSpec {
    #[default]
    Standard,
    Ignore,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyHost {
    host: String,
    port: u16,
}

impl ProxyHost {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().trim().to_ascii_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn uri_text(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for ProxyHost {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}:{}", self.host, self.port)
    }
}

/// Per-request tunables.
///
/// Each `RequestSpec` owns its own copy, cloned from the client default, so
/// concurrent requests never share a mutable configuration.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    pub(crate) socket_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) connection_request_timeout: Duration,
    pub(crate) execution_timeout: Option<Duration>,
    pub(crate) retry_times: usize,
    pub(crate) retry_interval: Duration,
    pub(crate) max_response_body_bytes: usize,
    pub(crate) query_charset: &'static Encoding,
    pub(crate) response_charset: &'static Encoding,
    pub(crate) user_agent: String,
    pub(crate) inspect_html_charset: bool,
    pub(crate) proxy: Option<ProxyHost>,
    pub(crate) redirect_policy: RedirectPolicy,
    pub(crate) cookie_spec: CookieSpec,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection_request_timeout: DEFAULT_CONNECTION_REQUEST_TIMEOUT,
            execution_timeout: None,
            retry_times: 0,
            retry_interval: Duration::ZERO,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            query_charset: UTF_8,
            response_charset: UTF_8,
            user_agent: USER_AGENT_CHROME.to_owned(),
            inspect_html_charset: false,
            proxy: None,
            redirect_policy: RedirectPolicy::default(),
            cookie_spec: CookieSpec::Standard,
        }
    }
}

impl RequestConfig {
    pub fn socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = socket_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn connection_request_timeout(mut self, connection_request_timeout: Duration) -> Self {
        self.connection_request_timeout = connection_request_timeout;
        self
    }

    /// Wall-clock cap for one attempt; `None` or a zero duration disables the watchdog.
    pub fn execution_timeout(mut self, execution_timeout: Option<Duration>) -> Self {
        self.execution_timeout = execution_timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn retry_times(mut self, retry_times: usize) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes;
        self
    }

    pub fn query_charset(mut self, query_charset: &'static Encoding) -> Self {
        self.query_charset = query_charset;
        self
    }

    pub fn response_charset(mut self, response_charset: &'static Encoding) -> Self {
        self.response_charset = response_charset;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn inspect_html_charset(mut self, inspect_html_charset: bool) -> Self {
        self.inspect_html_charset = inspect_html_charset;
        self
    }

    pub fn proxy(mut self, proxy: Option<ProxyHost>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.redirect_policy = redirect_policy;
        self
    }

    pub fn cookie_spec(mut self, cookie_spec: CookieSpec) -> Self {
        self.cookie_spec = cookie_spec;
        self
    }

    pub fn socket_timeout_value(&self) -> Duration {
        self.socket_timeout
    }

    pub fn connect_timeout_value(&self) -> Duration {
        self.connect_timeout
    }

    pub fn connection_request_timeout_value(&self) -> Duration {
        self.connection_request_timeout
    }

    pub fn execution_timeout_value(&self) -> Option<Duration> {
        self.execution_timeout
    }

    pub fn retry_times_value(&self) -> usize {
        self.retry_times
    }

    pub fn retry_interval_value(&self) -> Duration {
        self.retry_interval
    }

    pub fn max_response_body_bytes_value(&self) -> usize {
        self.max_response_body_bytes
    }

    pub fn query_charset_value(&self) -> &'static Encoding {
        self.query_charset
    }

    pub fn response_charset_value(&self) -> &'static Encoding {
        self.response_charset
    }

    pub fn user_agent_value(&self) -> &str {
        &self.user_agent
    }

    pub fn inspect_html_charset_value(&self) -> bool {
        self.inspect_html_charset
    }

    pub fn proxy_value(&self) -> Option<&ProxyHost> {
        self.proxy.as_ref()
    }

    pub fn redirect_policy_value(&self) -> RedirectPolicy {
        self.redirect_policy
    }

    pub fn cookie_spec_value(&self) -> CookieSpec {
        self.cookie_spec
    }
}

/// Pool-level tunables, fixed when the pool is created.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub(crate) max_connections: usize,
    pub(crate) max_connections_per_route: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) reaper_initial_delay: Duration,
    pub(crate) reaper_interval: Duration,
    pub(crate) tls_trust: TlsTrust,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_route: DEFAULT_MAX_CONNECTIONS_PER_ROUTE,
            keep_alive: DEFAULT_KEEP_ALIVE,
            reaper_initial_delay: DEFAULT_REAPER_INITIAL_DELAY,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            tls_trust: TlsTrust::Verify,
        }
    }
}

impl PoolConfig {
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn max_connections_per_route(mut self, max_connections_per_route: usize) -> Self {
        self.max_connections_per_route = max_connections_per_route.max(1);
        self
    }

    /// Idle expiry applied when a response advertises no `Keep-Alive: timeout`.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn reaper_initial_delay(mut self, reaper_initial_delay: Duration) -> Self {
        self.reaper_initial_delay = reaper_initial_delay;
        self
    }

    pub fn reaper_interval(mut self, reaper_interval: Duration) -> Self {
        self.reaper_interval = reaper_interval.max(Duration::from_millis(1));
        self
    }

    pub fn tls_trust(mut self, tls_trust: TlsTrust) -> Self {
        self.tls_trust = tls_trust;
        self
    }

    pub fn max_connections_value(&self) -> usize {
        self.max_connections
    }

    pub fn max_connections_per_route_value(&self) -> usize {
        self.max_connections_per_route
    }

    pub fn keep_alive_value(&self) -> Duration {
        self.keep_alive
    }

    pub fn tls_trust_value(&self) -> TlsTrust {
        self.tls_trust
    }
}
