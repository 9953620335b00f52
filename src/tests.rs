use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use http::{HeaderMap, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;

use crate::config::{PoolConfig, RequestConfig};
use crate::connect::{Connection, Route};
use crate::error::{HttpClientError, HttpClientErrorCode, TransportErrorKind};
use crate::pool::ConnectionPool;
use crate::request::{PreparedRequest, RequestSpec};
use crate::retry::ExecutionSupervisor;
use crate::transport::{RawReply, Transport};

fn route(uri: &str) -> Route {
    Route::from_uri(&uri.parse().expect("uri should parse"), None).expect("route should build")
}

async fn holding_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

async fn open_connection(addr: SocketAddr) -> Connection {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect to test listener");
    Connection::handshake(TokioIo::new(stream), false)
        .await
        .expect("http1 handshake")
}

fn assert_consistent(pool: &ConnectionPool) {
    let stats = pool.stats();
    assert_eq!(stats.available + stats.leased, stats.total, "{stats:?}");
    assert!(stats.total <= stats.max, "{stats:?}");
}

#[test]
fn pool_requires_a_runtime() {
    match ConnectionPool::new(PoolConfig::default()) {
        Err(HttpClientError::RuntimeUnavailable) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("pool should not start without a runtime"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_enforces_route_and_total_limits() {
    let pool = ConnectionPool::new(
        PoolConfig::default()
            .max_connections(3)
            .max_connections_per_route(2),
    )
    .expect("pool");
    let a = route("http://a.test/");
    let b = route("http://b.test/");
    let c = route("http://c.test/");
    let wait = Duration::from_millis(50);

    let _a1 = pool.acquire(&a, wait).await.expect("first lease on a");
    let _a2 = pool.acquire(&a, wait).await.expect("second lease on a");
    match pool.acquire(&a, wait).await {
        Err(HttpClientError::PoolExhausted { route, timeout_ms }) => {
            assert_eq!(route, "http://a.test:80");
            assert_eq!(timeout_ms, 50);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("per-route limit should hold"),
    }

    let _b1 = pool.acquire(&b, wait).await.expect("lease on b");
    let error = pool
        .acquire(&c, wait)
        .await
        .expect_err("total limit should hold");
    assert_eq!(error.code(), HttpClientErrorCode::PoolExhausted);

    let stats = pool.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.leased, 3);
    assert_eq!(stats.available, 0);
    assert_eq!(stats.pending, 0);
    pool.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_lease_frees_its_slot_for_waiters() {
    let pool = ConnectionPool::new(PoolConfig::default().max_connections_per_route(1)).expect("pool");
    let a = route("http://a.test/");
    let lease = pool
        .acquire(&a, Duration::from_millis(50))
        .await
        .expect("first lease");

    let waiter = {
        let pool = pool.clone();
        let a = a.clone();
        tokio::spawn(async move { pool.acquire(&a, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats().pending, 1);

    drop(lease);
    let second = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should wake up")
        .expect("waiter task")
        .expect("second lease");
    assert!(!second.is_reused());
    assert_eq!(pool.stats().pending, 0);
    assert_eq!(pool.stats().leased, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn released_connections_are_reused() {
    let (addr, server) = holding_server().await;
    let pool = ConnectionPool::new(PoolConfig::default()).expect("pool");
    let target = route(&format!("http://{addr}/"));

    let mut lease = pool
        .acquire(&target, Duration::from_millis(50))
        .await
        .expect("lease");
    assert!(lease.connection().is_none());
    lease.attach(open_connection(addr).await);
    lease.release(None);

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.available, 1);
    assert_eq!(stats.leased, 0);

    let reused = pool
        .acquire(&target, Duration::from_millis(50))
        .await
        .expect("reused lease");
    assert!(reused.is_reused());
    assert!(reused.connection().is_some_and(Connection::is_open));
    assert_consistent(&pool);
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_keep_alive_is_not_retained() {
    let (addr, server) = holding_server().await;
    let pool = ConnectionPool::new(PoolConfig::default()).expect("pool");
    let target = route(&format!("http://{addr}/"));

    let mut lease = pool
        .acquire(&target, Duration::from_millis(50))
        .await
        .expect("lease");
    lease.attach(open_connection(addr).await);
    lease.release(Some(Duration::ZERO));

    assert_eq!(pool.stats().total, 0);
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_expired_and_close_idle_evict_idle_connections() {
    let (addr, server) = holding_server().await;
    let pool = ConnectionPool::new(PoolConfig::default()).expect("pool");
    let short = route(&format!("http://{addr}/short"));
    let long = route(&format!("http://localhost:{}/long", addr.port()));

    let mut lease = pool.acquire(&short, Duration::from_millis(50)).await.expect("lease");
    lease.attach(open_connection(addr).await);
    lease.release(Some(Duration::from_millis(5)));

    let mut lease = pool.acquire(&long, Duration::from_millis(50)).await.expect("lease");
    lease.attach(open_connection(addr).await);
    lease.release(None);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(pool.close_expired(), 1);
    assert_eq!(pool.stats().available, 1);
    assert_eq!(pool.close_idle(Duration::from_secs(60)), 0);
    assert_eq!(pool.close_idle(Duration::ZERO), 1);
    assert_eq!(pool.stats().total, 0);
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn total_limit_evicts_the_oldest_idle_connection_of_another_route() {
    let (addr, server) = holding_server().await;
    let pool = ConnectionPool::new(PoolConfig::default().max_connections(1)).expect("pool");
    let first = route(&format!("http://{addr}/"));
    let second = route("http://other.test/");

    let mut lease = pool.acquire(&first, Duration::from_millis(50)).await.expect("lease");
    lease.attach(open_connection(addr).await);
    lease.release(None);
    assert_eq!(pool.stats().available, 1);

    let other = pool
        .acquire(&second, Duration::from_millis(50))
        .await
        .expect("idle connection of another route should be evicted");
    assert!(!other.is_reused());
    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.available, 0);
    assert_eq!(stats.leased, 1);
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_leases_never_exceed_the_limits() {
    let pool = ConnectionPool::new(
        PoolConfig::default()
            .max_connections(4)
            .max_connections_per_route(2),
    )
    .expect("pool");
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for index in 0..24 {
        let pool = pool.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            let target = route(&format!("http://host{}.test/", index % 3));
            let lease = pool
                .acquire(&target, Duration::from_secs(5))
                .await
                .expect("lease within timeout");
            let stats = pool.stats();
            assert_eq!(stats.available + stats.leased, stats.total, "{stats:?}");
            assert!(stats.total <= 4, "{stats:?}");
            peak.fetch_max(stats.leased, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(lease);
        }));
    }
    for task in tasks {
        task.await.expect("lease task");
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_fails_waiters_and_later_acquires() {
    let pool = ConnectionPool::new(PoolConfig::default().max_connections(1)).expect("pool");
    let a = route("http://a.test/");
    let _held = pool.acquire(&a, Duration::from_millis(50)).await.expect("lease");

    let waiter = {
        let pool = pool.clone();
        let a = a.clone();
        tokio::spawn(async move { pool.acquire(&a, Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.close();
    pool.close();
    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("close should wake the waiter")
        .expect("waiter task");
    match result {
        Err(HttpClientError::PoolClosed) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("closed pool should not hand out leases"),
    }
    assert!(pool.is_closed());
    assert!(matches!(
        pool.acquire(&a, Duration::from_millis(10)).await,
        Err(HttpClientError::PoolClosed)
    ));
}

#[derive(Clone, Copy)]
enum Behavior {
    Status(u16),
    ConnectRefused,
    Malformed,
    Hang,
}

struct ScriptedTransport {
    calls: AtomicUsize,
    script: fn(usize) -> Behavior,
}

impl ScriptedTransport {
    fn new(script: fn(usize) -> Behavior) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script,
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: &PreparedRequest,
        _config: &RequestConfig,
    ) -> impl Future<Output = Result<RawReply, HttpClientError>> + Send {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = (self.script)(call);
        let method = request.method().clone();
        let url = request.url().to_owned();
        async move {
            match behavior {
                Behavior::Status(code) => Ok(RawReply::buffered(
                    method,
                    StatusCode::from_u16(code).expect("valid status"),
                    HeaderMap::new(),
                    "body",
                    url,
                )),
                Behavior::ConnectRefused => Err(HttpClientError::Transport {
                    kind: TransportErrorKind::Connect,
                    method,
                    uri: url,
                    source: "connection refused".into(),
                }),
                Behavior::Malformed => Err(HttpClientError::MalformedRequest {
                    method: method.to_string(),
                    uri: url,
                    message: "rejected".to_owned(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(RawReply::buffered(method, StatusCode::OK, HeaderMap::new(), "", url))
                }
            }
        }
    }
}

fn spec() -> RequestSpec {
    RequestSpec::new("get", "http://x.test/a", RequestConfig::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_status_is_attempted_max_retries_plus_one_times() {
    let supervisor = ExecutionSupervisor::new(ScriptedTransport::new(|_| Behavior::Status(503)));
    let response = supervisor
        .send_with(spec(), 3, Duration::ZERO)
        .await
        .expect("last response is returned");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(supervisor.transport().calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_retries_means_a_single_attempt() {
    let supervisor = ExecutionSupervisor::new(ScriptedTransport::new(|_| Behavior::ConnectRefused));
    let error = supervisor
        .send_with(spec(), 0, Duration::ZERO)
        .await
        .expect_err("refused connection");
    match &error {
        HttpClientError::RequestFailed { attempts, source, .. } => {
            assert_eq!(*attempts, 1);
            assert!(matches!(
                **source,
                HttpClientError::Transport {
                    kind: TransportErrorKind::Connect,
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(error.code(), HttpClientErrorCode::Transport);
    assert_eq!(supervisor.transport().calls.load(Ordering::SeqCst), 1);

    let supervisor = ExecutionSupervisor::new(ScriptedTransport::new(|_| Behavior::Status(500)));
    let response = supervisor
        .send_with(spec(), 0, Duration::ZERO)
        .await
        .expect("response");
    assert_eq!(response.status_code(), 500);
    assert_eq!(supervisor.transport().calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_are_retried_until_success() {
    let supervisor = ExecutionSupervisor::new(ScriptedTransport::new(|call| match call {
        0 => Behavior::ConnectRefused,
        1 => Behavior::Status(502),
        _ => Behavior::Status(200),
    }));
    let started = Instant::now();
    let response = supervisor
        .send_with(spec(), 5, Duration::from_millis(30))
        .await
        .expect("third attempt succeeds");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text(), "body");
    assert_eq!(supervisor.transport().calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_retryable_errors_stop_the_loop() {
    let supervisor = ExecutionSupervisor::new(ScriptedTransport::new(|_| Behavior::Malformed));
    let error = supervisor
        .send_with(spec(), 5, Duration::ZERO)
        .await
        .expect_err("malformed request");
    assert_eq!(error.code(), HttpClientErrorCode::MalformedRequest);
    assert_eq!(error.attempts(), Some(1));
    assert_eq!(supervisor.transport().calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchdog_reports_execution_timeout() {
    let supervisor = ExecutionSupervisor::new(ScriptedTransport::new(|_| Behavior::Hang));
    let spec = spec().configure(|config| config.execution_timeout(Some(Duration::from_millis(50))));
    let started = Instant::now();
    let error = supervisor
        .send_with(spec, 2, Duration::ZERO)
        .await
        .expect_err("watchdog should fire");
    assert!(started.elapsed() < Duration::from_secs(5));
    match error.cause() {
        HttpClientError::ExecutionTimeout { timeout_ms, .. } => assert_eq!(*timeout_ms, 50),
        other => panic!("unexpected error: {other}"),
    }
    assert!(error.is_timeout());
    assert_eq!(supervisor.transport().calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_uses_the_retry_settings_of_the_request() {
    let supervisor = ExecutionSupervisor::new(ScriptedTransport::new(|_| Behavior::Status(404)));
    let spec = spec().configure(|config| config.retry_times(2));
    let response = supervisor.send(spec).await.expect("response");
    assert_eq!(response.status_code(), 404);
    assert_eq!(supervisor.transport().calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finalize_errors_are_returned_before_any_attempt() {
    let supervisor = ExecutionSupervisor::new(ScriptedTransport::new(|_| Behavior::Status(200)));
    let spec = RequestSpec::new("GET", "http://x.test/", RequestConfig::default())
        .add_header("bad header", "1");
    let error = supervisor
        .send_with(spec, 3, Duration::ZERO)
        .await
        .expect_err("invalid header name");
    assert_eq!(error.code(), HttpClientErrorCode::InvalidHeaderName);
    assert_eq!(error.attempts(), None);
    assert_eq!(supervisor.transport().calls.load(Ordering::SeqCst), 0);
}
