use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::connect::{Connection, Route};
use crate::error::HttpClientError;
use crate::util::lock_unpoisoned;

/// Point-in-time counters of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub leased: usize,
    pub pending: usize,
    pub max: usize,
}

struct IdleConnection {
    connection: Connection,
    idle_since: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct RouteState {
    idle: VecDeque<IdleConnection>,
    leased: usize,
}

impl RouteState {
    fn allocated(&self) -> usize {
        self.idle.len() + self.leased
    }
}

#[derive(Default)]
struct PoolState {
    routes: HashMap<Route, RouteState>,
    total: usize,
    pending: usize,
    closed: bool,
}

enum Checkout {
    Reused(Connection),
    Reserved,
}

impl PoolState {
    fn checkout(&mut self, route: &Route, config: &PoolConfig, now: Instant) -> Option<Checkout> {
        let PoolState { routes, total, .. } = self;
        let route_state = routes.entry(route.clone()).or_default();
        while let Some(idle) = route_state.idle.pop_back() {
            if idle.expires_at > now && idle.connection.is_open() {
                route_state.leased += 1;
                return Some(Checkout::Reused(idle.connection));
            }
            *total -= 1;
        }
        if route_state.allocated() >= config.max_connections_per_route {
            return None;
        }
        if *total >= config.max_connections {
            if !Self::evict_oldest_idle(routes, route) {
                if route_state_is_empty(routes, route) {
                    routes.remove(route);
                }
                return None;
            }
            *total -= 1;
        }
        if let Some(route_state) = routes.get_mut(route) {
            route_state.leased += 1;
            *total += 1;
            return Some(Checkout::Reserved);
        }
        None
    }

    fn evict_oldest_idle(routes: &mut HashMap<Route, RouteState>, except: &Route) -> bool {
        let victim = routes
            .iter()
            .filter(|(route, state)| *route != except && !state.idle.is_empty())
            .min_by_key(|(_, state)| state.idle.front().map(|idle| idle.idle_since))
            .map(|(route, _)| route.clone());
        let Some(victim) = victim else {
            return false;
        };
        if let Some(state) = routes.get_mut(&victim) {
            state.idle.pop_front();
            if state.allocated() == 0 {
                routes.remove(&victim);
            }
        }
        true
    }

    fn give_back(&mut self, route: &Route, idle: Option<IdleConnection>) {
        let closed = self.closed;
        let Some(route_state) = self.routes.get_mut(route) else {
            return;
        };
        route_state.leased = route_state.leased.saturating_sub(1);
        match idle {
            Some(idle) if !closed && idle.connection.is_open() => route_state.idle.push_back(idle),
            _ => self.total = self.total.saturating_sub(1),
        }
        if route_state.allocated() == 0 {
            self.routes.remove(route);
        }
    }

    fn retain_idle(&mut self, mut keep: impl FnMut(&IdleConnection) -> bool) -> usize {
        let mut removed = 0;
        for route_state in self.routes.values_mut() {
            let before = route_state.idle.len();
            route_state
                .idle
                .retain(|idle| idle.connection.is_open() && keep(idle));
            removed += before - route_state.idle.len();
        }
        self.routes.retain(|_, route_state| route_state.allocated() > 0);
        self.total = self.total.saturating_sub(removed);
        removed
    }
}

fn route_state_is_empty(routes: &HashMap<Route, RouteState>, route: &Route) -> bool {
    routes
        .get(route)
        .is_some_and(|route_state| route_state.allocated() == 0)
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn give_back(&self, route: &Route, idle: Option<IdleConnection>) {
        lock_unpoisoned(&self.state).give_back(route, idle);
        self.released.notify_waiters();
    }

    fn close_expired(&self) -> usize {
        let now = Instant::now();
        let removed = lock_unpoisoned(&self.state).retain_idle(|idle| idle.expires_at > now);
        if removed > 0 {
            self.released.notify_waiters();
        }
        removed
    }

    fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.state).closed
    }
}

struct PendingGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.pending = state.pending.saturating_sub(1);
    }
}

/// Bounded set of reusable connections keyed by [`Route`].
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates the pool and starts its reaper on the current tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self, HttpClientError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| HttpClientError::RuntimeUnavailable)?;
        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            reaper: Mutex::new(None),
        });
        let reaper = runtime.spawn(run_reaper(
            Arc::downgrade(&inner),
            inner.config.reaper_initial_delay,
            inner.config.reaper_interval,
        ));
        *lock_unpoisoned(&inner.reaper) = Some(reaper);
        info!(
            max_connections = inner.config.max_connections,
            max_connections_per_route = inner.config.max_connections_per_route,
            tls_trust = inner.config.tls_trust.as_str(),
            "connection pool created"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Leases a connection slot for `route`, waiting up to `timeout` for capacity.
    ///
    /// The lease carries an idle connection when one is reusable; otherwise it
    /// holds a reserved slot and the caller attaches a fresh connection.
    pub async fn acquire(
        &self,
        route: &Route,
        timeout: Duration,
    ) -> Result<PooledConnection, HttpClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut pending: Option<PendingGuard<'_>> = None;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock_unpoisoned(&self.inner.state);
                if state.closed {
                    return Err(HttpClientError::PoolClosed);
                }
                if let Some(checkout) = state.checkout(route, &self.inner.config, Instant::now()) {
                    drop(state);
                    drop(pending);
                    let (connection, reused) = match checkout {
                        Checkout::Reused(connection) => (Some(connection), true),
                        Checkout::Reserved => (None, false),
                    };
                    return Ok(PooledConnection {
                        pool: self.inner.clone(),
                        route: route.clone(),
                        connection,
                        reused,
                        returned: false,
                    });
                }
                if pending.is_none() {
                    state.pending += 1;
                }
            }
            if pending.is_none() {
                pending = Some(PendingGuard { inner: &self.inner });
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(route = %route, timeout_ms = timeout.as_millis(), "connection lease timed out");
                return Err(HttpClientError::PoolExhausted {
                    route: route.to_string(),
                    timeout_ms: timeout.as_millis(),
                });
            }
        }
    }

    /// Closes idle connections whose keep-alive window has elapsed.
    pub fn close_expired(&self) -> usize {
        self.inner.close_expired()
    }

    /// Closes connections idle for at least `idle_for`.
    pub fn close_idle(&self, idle_for: Duration) -> usize {
        let removed = lock_unpoisoned(&self.inner.state)
            .retain_idle(|idle| idle.idle_since.elapsed() < idle_for);
        if removed > 0 {
            self.inner.released.notify_waiters();
        }
        removed
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock_unpoisoned(&self.inner.state);
        let (available, leased) = state
            .routes
            .values()
            .fold((0, 0), |(available, leased), route_state| {
                (available + route_state.idle.len(), leased + route_state.leased)
            });
        PoolStats {
            total: state.total,
            available,
            leased,
            pending: state.pending,
            max: self.inner.config.max_connections,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Drops every idle connection, fails current and future waiters and stops the reaper.
    ///
    /// Leased connections are closed when their holders hand them back.
    pub fn close(&self) {
        let drained = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.retain_idle(|_| false)
        };
        self.inner.released.notify_waiters();
        if let Some(reaper) = lock_unpoisoned(&self.inner.reaper).take() {
            reaper.abort();
        }
        info!(closed_idle = drained, "connection pool closed");
    }
}

async fn run_reaper(pool: Weak<PoolInner>, initial_delay: Duration, interval: Duration) {
    tokio::time::sleep(initial_delay).await;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        let removed = inner.close_expired();
        if removed > 0 {
            debug!(removed, "reaper closed expired connections");
        }
    }
}

/// A leased pool slot.
///
/// Dropping the lease without [`PooledConnection::release`] closes the
/// connection and frees the slot.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    route: Route,
    connection: Option<Connection>,
    reused: bool,
    returned: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PooledConnection")
            .field("route", &self.route)
            .field("reused", &self.reused)
            .field("connection", &self.connection)
            .finish()
    }
}

impl PooledConnection {
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// True when the connection came from the idle set rather than a fresh connect.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    pub fn attach(&mut self, connection: Connection) {
        self.connection = Some(connection);
    }

    /// Returns the connection to the idle set, expiring after `keep_alive`
    /// or the pool default.
    pub fn release(mut self, keep_alive: Option<Duration>) {
        self.returned = true;
        let now = Instant::now();
        let keep_alive = keep_alive.unwrap_or(self.pool.config.keep_alive);
        let idle = self
            .connection
            .take()
            .filter(|_| !keep_alive.is_zero())
            .map(|connection| IdleConnection {
                connection,
                idle_since: now,
                expires_at: now + keep_alive,
            });
        self.pool.give_back(&self.route, idle);
    }

    /// Closes the connection and frees the slot.
    pub fn discard(self) {
        drop(self);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.returned {
            self.connection.take();
            self.pool.give_back(&self.route, None);
        }
    }
}
