use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use tower_service::Service;

use crate::connect::Route;
use crate::error::HttpClientError;

pub(crate) type BoxConnectError = Box<dyn StdError + Send + Sync>;

type TcpIo = <HttpConnector as Service<Uri>>::Response;

/// How the TCP leg of a route is dialed.
///
/// TLS is layered on top by the caller, so an `https` route through a proxy
/// runs its handshake end to end inside the tunnel.
#[derive(Clone)]
pub(crate) enum RouteConnector {
    Direct(HttpConnector),
    /// `CONNECT` tunnel through the proxy.
    Tunnel(Tunnel<HttpConnector>),
    /// Plain http relayed by the proxy; every dial goes to the proxy itself.
    Forward {
        direct: HttpConnector,
        proxy_uri: Uri,
    },
}

impl RouteConnector {
    pub(crate) fn for_route(
        route: &Route,
        connect_timeout: Duration,
    ) -> Result<Self, HttpClientError> {
        let mut direct = HttpConnector::new();
        direct.enforce_http(false);
        direct.set_nodelay(true);
        direct.set_connect_timeout(Some(connect_timeout));

        let Some(proxy) = route.proxy() else {
            return Ok(Self::Direct(direct));
        };
        let uri_text = proxy.uri_text();
        let proxy_uri: Uri = uri_text
            .parse()
            .map_err(|_| HttpClientError::InvalidUri { uri: uri_text })?;
        if route.is_secure() {
            Ok(Self::Tunnel(Tunnel::new(proxy_uri, direct)))
        } else {
            Ok(Self::Forward { direct, proxy_uri })
        }
    }
}

impl Service<Uri> for RouteConnector {
    type Response = TcpIo;
    type Error = BoxConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self {
            Self::Direct(direct) | Self::Forward { direct, .. } => direct
                .poll_ready(cx)
                .map_err(|error| Box::new(error) as BoxConnectError),
            Self::Tunnel(tunnel) => tunnel
                .poll_ready(cx)
                .map_err(|error| Box::new(error) as BoxConnectError),
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        match self {
            Self::Direct(direct) => {
                let connecting = direct.call(dst);
                Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) })
            }
            Self::Forward { direct, proxy_uri } => {
                let connecting = direct.call(proxy_uri.clone());
                Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) })
            }
            Self::Tunnel(tunnel) => {
                let connecting = tunnel.call(dst);
                Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) })
            }
        }
    }
}
