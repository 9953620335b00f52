//! `pooled-http` is a connection-pooled HTTP/1.1 client with flat-interval
//! retries, a per-attempt execution watchdog and charset-aware response decoding.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use pooled_http::prelude::HttpClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder()
//!         .connect_timeout(Duration::from_secs(2))
//!         .execution_timeout(Duration::from_secs(10))
//!         .retry_times(2)
//!         .retry_interval(Duration::from_millis(200))
//!         .inspect_html_charset(true)
//!         .try_build()?;
//!
//!     let response = client
//!         .send(client.get("https://example.com/search").add_param("q", "rust"))
//!         .await?;
//!
//!     println!("{} {}", response.status_code(), response.charset().name());
//!     println!("{}", response.text());
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! # Retries
//!
//! Any 4xx or 5xx response is retried like a transport failure, whatever the
//! method. Leave `retry_times` at 0 for requests that must not be replayed.

mod charset;
mod client;
mod config;
mod connect;
mod cookies;
mod entity;
mod error;
mod pool;
mod proxy;
mod request;
mod response;
mod retry;
mod tls;
mod transport;
mod util;

pub use crate::charset::{charset_from_content_type, charset_from_html, resolve_charset};
pub use crate::client::{HttpClient, HttpClientBuilder};
pub use crate::config::{
    CookieSpec, PoolConfig, ProxyHost, RedirectPolicy, RequestConfig, USER_AGENT_CHROME,
};
pub use crate::connect::{Connection, Route};
pub use crate::cookies::CookieJar;
pub use crate::error::{HttpClientError, HttpClientErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
pub use crate::request::{PreparedRequest, RequestSpec};
pub use crate::response::HttpResponse;
pub use crate::retry::ExecutionSupervisor;
pub use crate::tls::TlsTrust;
pub use crate::transport::{HyperTransport, RawReply, Transport};

pub use encoding_rs::Encoding;

pub type Result<T> = std::result::Result<T, HttpClientError>;

pub mod prelude {
    pub use crate::{
        CookieSpec, ExecutionSupervisor, HttpClient, HttpClientError, HttpClientErrorCode,
        HttpResponse, PoolConfig, RedirectPolicy, RequestConfig, RequestSpec, Result,
        TimeoutPhase, TlsTrust, Transport, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
