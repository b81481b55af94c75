//! HTTP routing and proxying
//!
//! Provides:
//! - Path routes resolved to direct or tunnelled targets
//! - Direct reverse proxying to plain HTTP targets
//! - The axum front that hands requests to the forwarder
//! - The handler serving requests that arrive through a tunnel

mod http;

pub use self::http::{router, DirectProxy, HttpState, LocalHandler};

use crate::config::RouteConfig;
use crate::tunnel::{PeerId, TunnelError};
use ::http::{StatusCode, Uri};
use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Scheme used in route targets that live behind a tunnel peer
pub const PEER_SCHEME: &str = "peer://";

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No route for path: {0}")]
    TargetNotFound(String),

    #[error("Invalid route pattern '{pattern}': {reason}")]
    InvalidRoute { pattern: String, reason: String },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

impl ProxyError {
    /// HTTP status reported to the original caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::TargetNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Tunnel(TunnelError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRoute { .. } | ProxyError::InvalidTarget(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Upstream(_) | ProxyError::Tunnel(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Where a matched request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Plain HTTP base URL, proxied directly
    Direct(Uri),
    /// Another router node, reached through the tunnel
    Peer(PeerId),
}

impl FromStr for Target {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(peer) = s.strip_prefix(PEER_SCHEME) {
            let peer = peer.trim_end_matches('/');
            if peer.is_empty() {
                return Err(ProxyError::InvalidTarget(format!("{} has no peer identity", s)));
            }
            return Ok(Target::Peer(PeerId::from(peer)));
        }

        let uri: Uri = s
            .parse()
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", s, e)))?;

        match (uri.scheme_str(), uri.authority()) {
            (Some("http"), Some(_)) => Ok(Target::Direct(uri)),
            (Some("https"), _) => Err(ProxyError::InvalidTarget(format!(
                "{}: https targets are not supported, terminate TLS in front of the target",
                s
            ))),
            _ => Err(ProxyError::InvalidTarget(format!(
                "{}: expected http://host[:port][/prefix] or {}identity",
                s, PEER_SCHEME
            ))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Direct(uri) => write!(f, "{}", uri),
            Target::Peer(peer) => write!(f, "{}{}", PEER_SCHEME, peer),
        }
    }
}

/// One path route
#[derive(Debug, Clone)]
pub struct Route {
    pattern: Regex,
    target: Target,
}

impl Route {
    pub fn new(pattern: &str, target: &str) -> Result<Self, ProxyError> {
        let pattern = Regex::new(pattern).map_err(|e| ProxyError::InvalidRoute {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            pattern,
            target: target.parse()?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

/// Ordered route table; the first matching route wins
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Compile the configured routes
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, ProxyError> {
        routes
            .iter()
            .map(|route| Route::new(&route.path, &route.target))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    /// Target of the first route whose pattern matches `path`
    pub fn find_target(&self, path: &str) -> Option<&Target> {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .map(Route::target)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Direct proxying to a plain HTTP target
#[async_trait]
pub trait LocalForwarder: Send + Sync {
    async fn forward(
        &self,
        base: &Uri,
        request: ::http::Request<Bytes>,
    ) -> Result<::http::Response<Bytes>, ProxyError>;
}
