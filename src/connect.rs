use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use http_body_util::Full;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::rt::{Read, Write};
use hyper_rustls::HttpsConnectorBuilder;
use rustls::ClientConfig;
use tokio::task::JoinHandle;
use tower_service::Service;
use tracing::debug;

use crate::config::ProxyHost;
use crate::error::{HttpClientError, TransportErrorKind};
use crate::proxy::{BoxConnectError, RouteConnector};
use crate::tls::{TlsTrust, build_client_config};
use crate::util::{classify_connect_error, default_port};

/// Pool key: where a physical connection goes, including the proxy it goes through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    secure: bool,
    host: String,
    port: u16,
    proxy: Option<ProxyHost>,
}

impl Route {
    pub fn from_uri(uri: &Uri, proxy: Option<&ProxyHost>) -> Result<Self, HttpClientError> {
        let invalid = || HttpClientError::InvalidUri {
            uri: uri.to_string(),
        };
        let secure = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => true,
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => false,
            _ => return Err(invalid()),
        };
        let host = uri.host().filter(|host| !host.is_empty()).ok_or_else(invalid)?;
        let port = default_port(uri).ok_or_else(invalid)?;
        Ok(Self {
            secure,
            host: host.to_ascii_lowercase(),
            port,
            proxy: proxy.cloned(),
        })
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&ProxyHost> {
        self.proxy.as_ref()
    }

    /// Plain http through a proxy writes absolute-form request targets.
    pub fn uses_absolute_form(&self) -> bool {
        self.proxy.is_some() && !self.secure
    }

    fn connect_uri(&self) -> Result<Uri, HttpClientError> {
        let text = self.to_origin_string();
        text.parse()
            .map_err(|_| HttpClientError::InvalidUri { uri: text })
    }

    fn to_origin_string(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{scheme}://[{}]:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.to_origin_string())?;
        if let Some(proxy) = &self.proxy {
            write!(formatter, " via {proxy}")?;
        }
        Ok(())
    }
}

/// One HTTP/1.1 connection with its driver task.
///
/// Dropping it aborts the driver, which closes the socket.
pub struct Connection {
    sender: SendRequest<Full<Bytes>>,
    absolute_form: bool,
    driver: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("open", &self.is_open())
            .field("absolute_form", &self.absolute_form)
            .finish()
    }
}

impl Connection {
    /// Runs the HTTP/1.1 handshake over an already established stream.
    pub async fn handshake<T>(io: T, absolute_form: bool) -> Result<Self, hyper::Error>
    where
        T: Read + Write + Unpin + Send + 'static,
    {
        let (sender, connection) = http1::handshake(io).await?;
        let driver = tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(error = %error, "pooled connection closed with error");
            }
        });
        Ok(Self {
            sender,
            absolute_form,
            driver,
        })
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.driver.is_finished()
    }

    /// Whether request targets must be written in absolute form (plain http through a proxy).
    pub fn uses_absolute_form(&self) -> bool {
        self.absolute_form
    }

    pub(crate) fn sender(&mut self) -> &mut SendRequest<Full<Bytes>> {
        &mut self.sender
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[derive(Debug)]
pub(crate) enum ConnectFailure {
    TimedOut,
    Failed {
        kind: TransportErrorKind,
        source: BoxConnectError,
    },
}

/// Opens new connections for a route, with or without TLS.
#[derive(Clone)]
pub(crate) struct Connector {
    tls: Arc<ClientConfig>,
}

impl Connector {
    pub(crate) fn new(trust: TlsTrust) -> Result<Self, HttpClientError> {
        Ok(Self {
            tls: build_client_config(trust)?,
        })
    }

    pub(crate) async fn connect(
        &self,
        route: &Route,
        connect_timeout: Duration,
    ) -> Result<Connection, ConnectFailure> {
        let uri = route.connect_uri().map_err(|error| ConnectFailure::Failed {
            kind: TransportErrorKind::Other,
            source: Box::new(error),
        })?;
        let dialer = RouteConnector::for_route(route, connect_timeout).map_err(|error| {
            ConnectFailure::Failed {
                kind: TransportErrorKind::Other,
                source: Box::new(error),
            }
        })?;
        let mut https = HttpsConnectorBuilder::new()
            .with_tls_config((*self.tls).clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(dialer);

        let established = tokio::time::timeout(connect_timeout, async {
            poll_fn(|cx| https.poll_ready(cx)).await?;
            https.call(uri).await
        })
        .await
        .map_err(|_| ConnectFailure::TimedOut)?
        .map_err(|source| ConnectFailure::Failed {
            kind: classify_connect_error(source.as_ref()),
            source,
        })?;

        let absolute_form = route.uses_absolute_form();
        let connection = Connection::handshake(established, absolute_form)
            .await
            .map_err(|error| ConnectFailure::Failed {
                kind: TransportErrorKind::Connect,
                source: Box::new(error),
            })?;
        debug!(route = %route, "opened pooled connection");
        Ok(connection)
    }
}
