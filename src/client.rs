use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use encoding_rs::Encoding;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{CookieSpec, PoolConfig, ProxyHost, RedirectPolicy, RequestConfig};
use crate::cookies::CookieJar;
use crate::error::HttpClientError;
use crate::pool::{ConnectionPool, PoolStats};
use crate::request::RequestSpec;
use crate::response::HttpResponse;
use crate::retry::ExecutionSupervisor;
use crate::tls::TlsTrust;
use crate::transport::HyperTransport;
use crate::util::lock_unpoisoned;

const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);
const DEFAULT_ROTATION_GRACE: Duration = Duration::from_secs(5 * 60);

pub struct HttpClientBuilder {
    request_config: RequestConfig,
    pool_config: PoolConfig,
    rotation_interval: Option<Duration>,
    rotation_grace: Duration,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self {
            request_config: RequestConfig::default(),
            pool_config: PoolConfig::default(),
            rotation_interval: None,
            rotation_grace: DEFAULT_ROTATION_GRACE,
        }
    }

    /// Replaces the default per-request configuration wholesale.
    pub fn request_config(mut self, request_config: RequestConfig) -> Self {
        self.request_config = request_config;
        self
    }

    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    pub fn socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.request_config = self.request_config.socket_timeout(socket_timeout);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.request_config = self.request_config.connect_timeout(connect_timeout);
        self
    }

    pub fn connection_request_timeout(mut self, connection_request_timeout: Duration) -> Self {
        self.request_config = self
            .request_config
            .connection_request_timeout(connection_request_timeout);
        self
    }

    pub fn execution_timeout(mut self, execution_timeout: Duration) -> Self {
        self.request_config = self.request_config.execution_timeout(Some(execution_timeout));
        self
    }

    pub fn retry_times(mut self, retry_times: usize) -> Self {
        self.request_config = self.request_config.retry_times(retry_times);
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.request_config = self.request_config.retry_interval(retry_interval);
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.request_config = self
            .request_config
            .max_response_body_bytes(max_response_body_bytes);
        self
    }

    pub fn query_charset(mut self, query_charset: &'static Encoding) -> Self {
        self.request_config = self.request_config.query_charset(query_charset);
        self
    }

    pub fn response_charset(mut self, response_charset: &'static Encoding) -> Self {
        self.request_config = self.request_config.response_charset(response_charset);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.request_config = self.request_config.user_agent(user_agent);
        self
    }

    pub fn inspect_html_charset(mut self, inspect_html_charset: bool) -> Self {
        self.request_config = self.request_config.inspect_html_charset(inspect_html_charset);
        self
    }

    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.request_config = self
            .request_config
            .proxy(Some(ProxyHost::new(host, port)));
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.request_config = self.request_config.redirect_policy(redirect_policy);
        self
    }

    pub fn cookie_spec(mut self, cookie_spec: CookieSpec) -> Self {
        self.request_config = self.request_config.cookie_spec(cookie_spec);
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.pool_config = self.pool_config.max_connections(max_connections);
        self
    }

    pub fn max_connections_per_route(mut self, max_connections_per_route: usize) -> Self {
        self.pool_config = self
            .pool_config
            .max_connections_per_route(max_connections_per_route);
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.pool_config = self.pool_config.keep_alive(keep_alive);
        self
    }

    pub fn reaper_initial_delay(mut self, reaper_initial_delay: Duration) -> Self {
        self.pool_config = self.pool_config.reaper_initial_delay(reaper_initial_delay);
        self
    }

    pub fn reaper_interval(mut self, reaper_interval: Duration) -> Self {
        self.pool_config = self.pool_config.reaper_interval(reaper_interval);
        self
    }

    /// `TlsTrust::Permissive` accepts any server certificate.
    pub fn tls_trust(mut self, tls_trust: TlsTrust) -> Self {
        self.pool_config = self.pool_config.tls_trust(tls_trust);
        self
    }

    /// Rotates the connection pool every three hours.
    pub fn rotation_enabled(mut self, enabled: bool) -> Self {
        self.rotation_interval = enabled.then_some(DEFAULT_ROTATION_INTERVAL);
        self
    }

    pub fn rotation_interval(mut self, rotation_interval: Duration) -> Self {
        self.rotation_interval = Some(rotation_interval.max(Duration::from_millis(1)));
        self
    }

    /// How long a replaced pool keeps serving in-flight leases before it is closed.
    pub fn rotation_grace(mut self, rotation_grace: Duration) -> Self {
        self.rotation_grace = rotation_grace;
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn try_build(self) -> Result<HttpClient, HttpClientError> {
        let cookies = CookieJar::new();
        let first = Generation::new(0, &self.pool_config, &cookies)?;
        let inner = Arc::new(ClientInner {
            request_config: self.request_config,
            pool_config: self.pool_config,
            cookies,
            current: RwLock::new(Arc::new(first)),
            rotation_grace: self.rotation_grace,
            retired: Mutex::new(Vec::new()),
            rotation_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        if let Some(interval) = self.rotation_interval {
            let task = tokio::spawn(run_rotation(Arc::downgrade(&inner), interval));
            *lock_unpoisoned(&inner.rotation_task) = Some(task);
        }
        Ok(HttpClient { inner })
    }

    pub fn build(self) -> HttpClient {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build http client: {error}"))
    }
}

struct Generation {
    id: u64,
    supervisor: ExecutionSupervisor<HyperTransport>,
}

impl Generation {
    fn new(id: u64, pool_config: &PoolConfig, cookies: &CookieJar) -> Result<Self, HttpClientError> {
        let pool = ConnectionPool::new(pool_config.clone())?;
        let transport = HyperTransport::new(pool, cookies.clone())?;
        Ok(Self {
            id,
            supervisor: ExecutionSupervisor::new(transport),
        })
    }

    fn pool(&self) -> &ConnectionPool {
        self.supervisor.transport().pool()
    }
}

/// A pool swapped out by rotation, waiting out its grace period.
struct Retired {
    pool: ConnectionPool,
    closer: JoinHandle<()>,
}

struct ClientInner {
    request_config: RequestConfig,
    pool_config: PoolConfig,
    cookies: CookieJar,
    current: RwLock<Arc<Generation>>,
    rotation_grace: Duration,
    retired: Mutex<Vec<Retired>>,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClientInner {
    fn current(&self) -> Arc<Generation> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rotate(&self) -> Result<u64, HttpClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HttpClientError::PoolClosed);
        }
        let (id, previous) = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let id = current.id + 1;
            let next = Arc::new(Generation::new(id, &self.pool_config, &self.cookies)?);
            (id, std::mem::replace(&mut *current, next))
        };
        info!(
            generation = id,
            grace_ms = self.rotation_grace.as_millis() as u64,
            "http client rotated connection pool"
        );

        let grace = self.rotation_grace;
        if grace.is_zero() {
            previous.pool().close();
        } else {
            let pool = previous.pool().clone();
            let closer = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                previous.pool().close();
            });
            let mut retired = lock_unpoisoned(&self.retired);
            retired.retain(|entry| !entry.closer.is_finished());
            retired.push(Retired { pool, closer });
        }

        // A close racing this rotation may have missed the new pool.
        if self.closed.load(Ordering::Acquire) {
            self.close_pools();
        }
        Ok(id)
    }

    /// Closes the current pool and every retired one still in its grace period.
    fn close_pools(&self) {
        for retired in lock_unpoisoned(&self.retired).drain(..) {
            retired.closer.abort();
            retired.pool.close();
        }
        self.current().pool().close();
    }
}

async fn run_rotation(client: Weak<ClientInner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = client.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        if let Err(error) = inner.rotate() {
            warn!(error = %error, "scheduled connection pool rotation failed");
        }
    }
}

/// Pooled HTTP/1.1 client.
///
/// Cloning is cheap; clones share the pool, the cookie jar and the default
/// request configuration.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("generation", &self.generation())
            .field("pool", &self.pool_stats())
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    pub fn default_config(&self) -> &RequestConfig {
        &self.inner.request_config
    }

    /// A request for any method; the method is trimmed and uppercased.
    pub fn request(&self, method: impl AsRef<str>, url: impl Into<String>) -> RequestSpec {
        RequestSpec::new(method, url, self.inner.request_config.clone())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestSpec {
        self.request("GET", url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestSpec {
        self.request("POST", url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestSpec {
        self.request("PUT", url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestSpec {
        self.request("PATCH", url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestSpec {
        self.request("DELETE", url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestSpec {
        self.request("HEAD", url)
    }

    pub fn options(&self, url: impl Into<String>) -> RequestSpec {
        self.request("OPTIONS", url)
    }

    pub fn trace(&self, url: impl Into<String>) -> RequestSpec {
        self.request("TRACE", url)
    }

    /// Sends with the retry settings carried by the request's config.
    pub async fn send(&self, spec: RequestSpec) -> Result<HttpResponse, HttpClientError> {
        let generation = self.inner.current();
        generation.supervisor.send(spec).await
    }

    pub async fn send_with_retry(
        &self,
        spec: RequestSpec,
        max_retries: usize,
        retry_interval: Duration,
    ) -> Result<HttpResponse, HttpClientError> {
        let generation = self.inner.current();
        generation
            .supervisor
            .send_with(spec, max_retries, retry_interval)
            .await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.current().pool().stats()
    }

    pub fn close_expired_connections(&self) -> usize {
        self.inner.current().pool().close_expired()
    }

    pub fn close_idle_connections(&self, idle_for: Duration) -> usize {
        self.inner.current().pool().close_idle(idle_for)
    }

    /// Swaps in a fresh pool and closes the current one after the rotation grace.
    ///
    /// Returns the new generation number.
    pub fn rotate(&self) -> Result<u64, HttpClientError> {
        self.inner.rotate()
    }

    /// Starts at 0 and grows by one per rotation.
    pub fn generation(&self) -> u64 {
        self.inner.current().id
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.inner.cookies
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops rotation and closes every pool, including those still inside
    /// their rotation grace. Requests still waiting for a connection fail
    /// with [`HttpClientError::PoolClosed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = lock_unpoisoned(&self.inner.rotation_task).take() {
            task.abort();
        }
        self.inner.close_pools();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::HttpClient;
    use crate::util::lock_unpoisoned;

    #[tokio::test]
    async fn close_reaches_pools_still_in_their_rotation_grace() {
        let client = HttpClient::builder()
            .rotation_grace(Duration::from_secs(300))
            .try_build()
            .expect("client should build");
        let first = client.inner.current().pool().clone();
        assert_eq!(client.rotate().expect("rotation"), 1);
        let second = client.inner.current().pool().clone();
        assert_eq!(client.rotate().expect("rotation"), 2);
        assert!(!first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(lock_unpoisoned(&client.inner.retired).len(), 2);

        client.close();
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert!(client.inner.current().pool().is_closed());
        assert!(lock_unpoisoned(&client.inner.retired).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rotations_get_distinct_generations() {
        let client = HttpClient::builder()
            .rotation_grace(Duration::ZERO)
            .try_build()
            .expect("client should build");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.rotate() })
            })
            .collect();
        let mut generations = Vec::new();
        for task in tasks {
            generations.push(task.await.expect("rotation task").expect("rotation"));
        }
        generations.sort_unstable();
        assert_eq!(generations, (1..=8).collect::<Vec<u64>>());
        assert_eq!(client.generation(), 8);
        client.close();
    }
}
