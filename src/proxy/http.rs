//! HTTP front, direct proxy and tunnel-side request handling

use super::{LocalForwarder, ProxyError, RouteTable, Target};
use crate::tunnel::{Forwarder, Frame, RequestHandler};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use http::uri::{PathAndQuery, Uri};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Message carried by the Error frame when a tunnelled path has no direct route
pub const TARGET_NOT_FOUND: &str = "target not found";

/// Largest upstream body buffered; anything bigger could not be tunnelled back
const MAX_RESPONSE_SIZE: usize = crate::MAX_FRAME_SIZE - 64 * 1024;

/// Payload bytes included in debug logs
const LOG_PREVIEW_LEN: usize = 1024;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop as well
    let named: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Join the request's path and query onto the target base URL
fn target_uri(base: &Uri, original: &Uri) -> Result<Uri, ProxyError> {
    let prefix = base.path().trim_end_matches('/');
    let path_and_query = original
        .path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/");

    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(
        format!("{}{}", prefix, path_and_query)
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("{}: {}", path_and_query, e)))?,
    );

    Uri::from_parts(parts).map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", base, e)))
}

fn preview(body: &Bytes) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(&body[..body.len().min(LOG_PREVIEW_LEN)])
}

/// Reverse proxy to plain HTTP targets.
///
/// Request and response bodies are fully buffered.
#[derive(Clone)]
pub struct DirectProxy {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
    max_response_size: usize,
}

impl DirectProxy {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .build_http();

        Self {
            client,
            timeout,
            max_response_size: MAX_RESPONSE_SIZE,
        }
    }

    /// Cap on buffered upstream response bodies
    pub fn with_max_response_size(mut self, max: usize) -> Self {
        self.max_response_size = max;
        self
    }
}

#[async_trait]
impl LocalForwarder for DirectProxy {
    async fn forward(
        &self,
        base: &Uri,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, ProxyError> {
        let (mut parts, body) = request.into_parts();

        let original_host = parts.headers.get(HOST).cloned();
        parts.uri = target_uri(base, &parts.uri)?;
        strip_hop_by_hop(&mut parts.headers);

        if let Some(host) = original_host {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(authority) = base.authority() {
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", base, e)))?;
            parts.headers.insert(HOST, host);
        }

        debug!("Proxying {} {}", parts.method, parts.uri);
        let outgoing = http::Request::from_parts(parts, Full::new(body));

        let response = tokio::time::timeout(self.timeout, self.client.request(outgoing))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(self.timeout))?
            .map_err(|e| ProxyError::Upstream(format!("{}: {}", base, e)))?;

        let (mut parts, body) = response.into_parts();
        let body = Limited::new(body, self.max_response_size)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    ProxyError::Upstream(format!(
                        "Response from {} exceeds {} bytes",
                        base, self.max_response_size
                    ))
                } else {
                    ProxyError::Upstream(format!("Reading response from {}: {}", base, e))
                }
            })?
            .to_bytes();

        strip_hop_by_hop(&mut parts.headers);
        Ok(http::Response::from_parts(parts, body))
    }
}

/// Serves Request frames that arrive through a tunnel.
///
/// Only direct routes are served; a tunnelled request is never sent on
/// to another peer.
pub struct LocalHandler {
    routes: Arc<RouteTable>,
    local: Arc<dyn LocalForwarder>,
}

impl LocalHandler {
    pub fn new(routes: Arc<RouteTable>, local: Arc<dyn LocalForwarder>) -> Self {
        Self { routes, local }
    }
}

#[async_trait]
impl RequestHandler for LocalHandler {
    async fn handle(&self, request: Frame) -> Frame {
        let id = request.id;
        let request = match request.into_request() {
            Ok(request) => request,
            Err(e) => return Frame::error(id, e.to_string()),
        };

        let path = request.uri().path().to_string();
        match self.routes.find_target(&path) {
            Some(Target::Direct(base)) => {
                debug!(
                    "Tunnelled request {} {} to {}, payload: {}",
                    request.method(),
                    path,
                    base,
                    preview(request.body())
                );
                match self.local.forward(base, request).await {
                    Ok(response) => Frame::from_response(id, response),
                    Err(e) => {
                        warn!("Tunnelled request for {} failed: {}", path, e);
                        Frame::error(id, e.to_string())
                    }
                }
            }
            Some(Target::Peer(peer)) => {
                debug!("Tunnelled request for {} routes to peer {}, refusing", path, peer);
                Frame::error(id, TARGET_NOT_FOUND)
            }
            None => {
                debug!("Tunnelled request for {} has no route", path);
                Frame::error(id, TARGET_NOT_FOUND)
            }
        }
    }
}

/// Shared state of the HTTP front
#[derive(Clone)]
pub struct HttpState {
    pub routes: Arc<RouteTable>,
    pub forwarder: Arc<Forwarder>,
    pub max_body_size: usize,
}

/// Build the HTTP front; every path goes through the route table
pub fn router(state: HttpState) -> Router {
    Router::new().fallback(handle_request).with_state(state)
}

async fn handle_request(
    State(state): State<HttpState>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let target = state
        .routes
        .find_target(&path)
        .cloned()
        .ok_or_else(|| ProxyError::TargetNotFound(path.clone()))
        .inspect_err(|_| debug!("No route for {}", path))?;

    let body = Limited::new(body, state.max_body_size)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                ProxyError::BodyTooLarge(state.max_body_size)
            } else {
                ProxyError::InvalidRequest(format!("Reading request body: {}", e))
            }
        })?
        .to_bytes();

    debug!(
        "{} {} to {}, payload: {}",
        parts.method,
        path,
        target,
        preview(&body)
    );

    let response = state
        .forwarder
        .forward(&target, http::Request::from_parts(parts, body))
        .await
        .inspect_err(|e| warn!("Forwarding {} to {} failed: {}", path, target, e))?;

    Ok(response.map(Body::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Route;
    use crate::tunnel::{FrameKind, Hub};
    use axum::routing::post;
    use tokio::net::TcpListener;

    async fn spawn_app(app: Router) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn echo(headers: HeaderMap, body: Bytes) -> String {
        let forwarded = headers
            .get("x-forwarded-host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        format!("{}|{}", forwarded, String::from_utf8_lossy(&body))
    }

    #[test]
    fn test_target_uri_joins_prefix() {
        let base: Uri = "http://backend:9000/v2/".parse().unwrap();
        let original: Uri = "/api/items?page=2".parse().unwrap();
        assert_eq!(
            target_uri(&base, &original).unwrap().to_string(),
            "http://backend:9000/v2/api/items?page=2"
        );

        let base: Uri = "http://backend:9000".parse().unwrap();
        assert_eq!(
            target_uri(&base, &original).unwrap().to_string(),
            "http://backend:9000/api/items?page=2"
        );
    }

    #[test]
    fn test_hop_by_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[tokio::test]
    async fn test_local_handler_refuses_peer_routes() {
        let routes = RouteTable::new(vec![Route::new("^/far", "peer://elsewhere").unwrap()]);
        let handler = LocalHandler::new(
            Arc::new(routes),
            Arc::new(DirectProxy::new(Duration::from_secs(1))),
        );

        let reply = handler
            .handle(Frame::request(5, "GET", "/far/away", Vec::new(), Bytes::new()))
            .await;
        assert_eq!(reply.kind, FrameKind::Error);
        assert_eq!(reply.error_message().as_deref(), Some(TARGET_NOT_FOUND));

        let reply = handler
            .handle(Frame::request(6, "GET", "/unrouted", Vec::new(), Bytes::new()))
            .await;
        assert_eq!(reply.error_message().as_deref(), Some(TARGET_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_local_handler_proxies_direct_routes() {
        let upstream = spawn_app(Router::new().route("/v1/echo", post(echo))).await;
        let routes = RouteTable::new(vec![Route::new(
            "^/echo",
            &format!("http://{}/v1", upstream),
        )
        .unwrap()]);
        let handler = LocalHandler::new(
            Arc::new(routes),
            Arc::new(DirectProxy::new(Duration::from_secs(5))),
        );

        let headers = vec![("host".to_string(), "front.example".to_string())];
        let reply = handler
            .handle(Frame::request(9, "POST", "/echo", headers, Bytes::from("ping")))
            .await;

        assert_eq!(reply.kind, FrameKind::Response);
        assert_eq!(reply.status, 200);
        assert_eq!(&reply.body[..], b"front.example|ping");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_becomes_error_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let routes = RouteTable::new(vec![Route::new("/", &format!("http://{}", addr)).unwrap()]);
        let handler = LocalHandler::new(
            Arc::new(routes),
            Arc::new(DirectProxy::new(Duration::from_secs(5))),
        );

        let reply = handler
            .handle(Frame::request(3, "GET", "/down", Vec::new(), Bytes::new()))
            .await;
        assert_eq!(reply.kind, FrameKind::Error);
        assert_eq!(reply.id, 3);
    }

    #[tokio::test]
    async fn test_front_statuses() {
        let upstream = spawn_app(Router::new().route("/echo", post(echo))).await;
        let routes = Arc::new(RouteTable::new(vec![
            Route::new("^/echo", &format!("http://{}", upstream)).unwrap(),
            Route::new("^/remote", "peer://absent").unwrap(),
        ]));
        let direct = Arc::new(DirectProxy::new(Duration::from_secs(5)));
        let forwarder = Arc::new(Forwarder::new(Hub::new(), direct, Duration::from_secs(1)));
        let front = spawn_app(router(HttpState {
            routes,
            forwarder,
            max_body_size: 16,
        }))
        .await;

        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let send = |method: &str, path: &str, body: &'static str| {
            let request = http::Request::builder()
                .method(method)
                .uri(format!("http://{}{}", front, path))
                .body(Full::new(Bytes::from(body)))
                .unwrap();
            client.request(request)
        };

        let response = send("POST", "/echo", "hello").await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], format!("{}|hello", front).as_bytes());

        let response = send("GET", "/nowhere", "").await.unwrap();
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);

        let response = send("GET", "/remote/x", "").await.unwrap();
        assert_eq!(response.status(), http::StatusCode::BAD_GATEWAY);

        let response = send("POST", "/echo", "this body is far too long").await.unwrap();
        assert_eq!(response.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_oversized_upstream_response_rejected() {
        let upstream = spawn_app(Router::new().route(
            "/big",
            axum::routing::get(|| async { vec![b'x'; 4096] }),
        ))
        .await;
        let base: Uri = format!("http://{}", upstream).parse().unwrap();
        let proxy = DirectProxy::new(Duration::from_secs(5)).with_max_response_size(1024);

        let request = http::Request::builder().uri("/big").body(Bytes::new()).unwrap();
        let err = proxy.forward(&base, request).await.unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(message) if message.contains("exceeds")));
    }
}
