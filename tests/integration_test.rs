//! Integration tests for Bifrost
//!
//! Two router nodes linked over loopback TCP:
//! - Reply correlation with out-of-order replies
//! - Error frames, timeouts and connection loss as seen by the caller
//! - Reconnecting client against an unreachable peer
//! - Replacement of a peer's connection
//! - End-to-end HTTP through the front, the tunnel and a local upstream

use async_trait::async_trait;
use bifrost::protocol::HandshakeRole;
use bifrost::proxy::{router, DirectProxy, HttpState, LocalHandler, Route, RouteTable};
use bifrost::transport::{dial, run_link, serve_tunnels, TransportConfig};
use bifrost::tunnel::{
    Backoff, Client, ClientHandle, Forwarder, Frame, Hub, PeerId, RequestHandler,
    TunnelConnection, TunnelError,
};
use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const SERVER: &str = "datacenter";
const CLIENT: &str = "edge";

/// Replies with the request path after a path-dependent delay
struct Scripted;

#[async_trait]
impl RequestHandler for Scripted {
    async fn handle(&self, request: Frame) -> Frame {
        match request.path.as_str() {
            "/slow" => tokio::time::sleep(Duration::from_millis(300)).await,
            "/hang" => tokio::time::sleep(Duration::from_secs(3600)).await,
            _ => {}
        }
        Frame::response(request.id, 200, Vec::new(), Bytes::from(request.path.clone()))
    }
}

fn get(path: &str) -> Request<Bytes> {
    Request::builder().uri(path).body(Bytes::new()).unwrap()
}

fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(20), Duration::from_millis(100))
}

async fn start_acceptor(
    identity: &str,
    handler: Arc<dyn RequestHandler>,
) -> (SocketAddr, Arc<Hub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Hub::new();

    tokio::spawn(serve_tunnels(
        listener,
        PeerId::from(identity),
        Arc::clone(&hub),
        handler,
        TransportConfig::default(),
    ));

    (addr, hub)
}

fn start_client(
    addr: SocketAddr,
    identity: &str,
    hub: &Arc<Hub>,
    handler: Arc<dyn RequestHandler>,
) -> ClientHandle {
    Client::new(addr.to_string(), PeerId::from(identity), Arc::clone(hub), handler)
        .with_backoff(fast_backoff())
        .spawn()
}

async fn wait_for_peer(hub: &Hub, peer: &str) -> Arc<TunnelConnection> {
    let peer = PeerId::from(peer);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(conn) = hub.lookup(&peer) {
                return conn;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer never became active")
}

/// Client node linked to a server node running `Scripted`
async fn linked_pair() -> (Arc<Hub>, Arc<Hub>, ClientHandle) {
    let (addr, server_hub) = start_acceptor(SERVER, Arc::new(Scripted)).await;
    let client_hub = Hub::new();
    let client = start_client(addr, CLIENT, &client_hub, Arc::new(Scripted));

    wait_for_peer(&client_hub, SERVER).await;
    wait_for_peer(&server_hub, CLIENT).await;
    (client_hub, server_hub, client)
}

fn forwarder(hub: &Arc<Hub>, timeout: Duration) -> Arc<Forwarder> {
    Arc::new(Forwarder::new(
        Arc::clone(hub),
        Arc::new(DirectProxy::new(Duration::from_secs(5))),
        timeout,
    ))
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let (client_hub, _server_hub, _client) = linked_pair().await;
    let fwd = forwarder(&client_hub, Duration::from_secs(5));
    let peer = PeerId::from(SERVER);

    let slow = {
        let fwd = Arc::clone(&fwd);
        let peer = peer.clone();
        tokio::spawn(async move {
            fwd.forward_via_tunnel(&peer, &get("/slow"), Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = fwd
        .forward_via_tunnel(&peer, &get("/fast"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(&fast.body()[..], b"/fast");
    assert!(!slow.is_finished(), "second reply should overtake the first");

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(&slow.body()[..], b"/slow");
}

#[tokio::test]
async fn test_many_concurrent_exchanges_on_one_link() {
    let (client_hub, _server_hub, _client) = linked_pair().await;
    let fwd = forwarder(&client_hub, Duration::from_secs(5));

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let fwd = Arc::clone(&fwd);
            tokio::spawn(async move {
                let path = format!("/item/{}", i);
                let response = fwd
                    .forward_via_tunnel(&PeerId::from(SERVER), &get(&path), Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(response.body(), &Bytes::from(path));
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(wait_for_peer(&client_hub, SERVER).await.pending_count(), 0);
}

#[tokio::test]
async fn test_error_frame_reaches_caller() {
    // The server node has no routes, so every tunnelled request is refused
    let handler = Arc::new(LocalHandler::new(
        Arc::new(RouteTable::default()),
        Arc::new(DirectProxy::new(Duration::from_secs(1))),
    ));
    let (addr, _server_hub) = start_acceptor(SERVER, handler).await;
    let client_hub = Hub::new();
    let _client = start_client(addr, CLIENT, &client_hub, Arc::new(Scripted));
    wait_for_peer(&client_hub, SERVER).await;

    let err = forwarder(&client_hub, Duration::from_secs(5))
        .forward_via_tunnel(&PeerId::from(SERVER), &get("/missing"), Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        TunnelError::PeerError(message) => assert_eq!(message, "target not found"),
        other => panic!("expected peer error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_outstanding_exchanges_fail_when_link_drops() {
    let (client_hub, server_hub, _client) = linked_pair().await;
    let fwd = forwarder(&client_hub, Duration::from_secs(30));

    let waiting: Vec<_> = (0..8)
        .map(|_| {
            let fwd = Arc::clone(&fwd);
            tokio::spawn(async move {
                fwd.forward_via_tunnel(&PeerId::from(SERVER), &get("/hang"), Duration::from_secs(30))
                    .await
            })
        })
        .collect();

    let conn = wait_for_peer(&client_hub, SERVER).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while conn.pending_count() < 8 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("exchanges never became outstanding");

    wait_for_peer(&server_hub, CLIENT).await.close();

    for task in waiting {
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("caller was not released")
            .unwrap();
        assert!(matches!(result, Err(TunnelError::PeerUnavailable(_))));
    }

    assert!(conn.is_closed());
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn test_timeout_keeps_link_usable() {
    let (client_hub, _server_hub, _client) = linked_pair().await;
    let fwd = forwarder(&client_hub, Duration::from_secs(5));
    let peer = PeerId::from(SERVER);
    let conn = wait_for_peer(&client_hub, SERVER).await;

    let err = fwd
        .forward_via_tunnel(&peer, &get("/hang"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Timeout(_)));
    assert_eq!(conn.pending_count(), 0);

    let response = fwd
        .forward_via_tunnel(&peer, &get("/after"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(&response.body()[..], b"/after");
    assert_eq!(client_hub.lookup(&peer).unwrap().id(), conn.id());
}

#[tokio::test]
async fn test_unreachable_peer_fails_fast_while_client_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let hub = Hub::new();
    let client = start_client(addr, CLIENT, &hub, Arc::new(Scripted));

    let started = Instant::now();
    let err = forwarder(&hub, Duration::from_secs(30))
        .forward_via_tunnel(&PeerId::from(SERVER), &get("/x"), Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::PeerUnavailable(_)));
    assert!(started.elapsed() < Duration::from_secs(1));

    tokio::time::timeout(Duration::from_secs(5), async {
        while client.attempts() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client stopped retrying");
    assert!(!client.is_finished());
    client.abort();
}

#[tokio::test]
async fn test_client_reconnects_after_link_loss() {
    let (client_hub, server_hub, _client) = linked_pair().await;
    let first = wait_for_peer(&client_hub, SERVER).await;

    wait_for_peer(&server_hub, CLIENT).await.close();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(conn) = client_hub.lookup(&PeerId::from(SERVER)) {
                if conn.id() != first.id() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never reconnected");
    assert!(first.is_closed());
}

fn spawn_link(stream: tokio::net::TcpStream) {
    tokio::spawn(async move {
        let hub = Hub::new();
        let _ = run_link(
            stream,
            &PeerId::from(CLIENT),
            HandshakeRole::Initiator,
            &hub,
            Arc::new(Scripted),
            |_| {},
        )
        .await;
    });
}

#[tokio::test]
async fn test_new_link_replaces_old_one() {
    let (addr, server_hub) = start_acceptor(SERVER, Arc::new(Scripted)).await;
    let config = TransportConfig::default();

    spawn_link(dial(&addr.to_string(), &config).await.unwrap());
    let first = wait_for_peer(&server_hub, CLIENT).await;

    spawn_link(dial(&addr.to_string(), &config).await.unwrap());
    let second = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let conn = wait_for_peer(&server_hub, CLIENT).await;
            if conn.id() != first.id() {
                return conn;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second link never replaced the first");

    assert!(first.is_closed());
    assert!(second.is_active());
    assert_eq!(server_hub.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_http_through_tunnel() {
    use axum::routing::post;

    // Upstream service reachable only from the server node
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let service = axum::Router::new().route(
        "/svc/api/orders",
        post(|body: Bytes| async move { format!("accepted {}", String::from_utf8_lossy(&body)) }),
    );
    tokio::spawn(async move { axum::serve(upstream, service).await.unwrap() });

    // Server node: direct route to the upstream
    let server_routes = Arc::new(RouteTable::new(vec![Route::new(
        "^/api/",
        &format!("http://{}/svc", upstream_addr),
    )
    .unwrap()]));
    let direct = Arc::new(DirectProxy::new(Duration::from_secs(5)));
    let (tunnel_addr, _server_hub) =
        start_acceptor(SERVER, Arc::new(LocalHandler::new(server_routes, direct))).await;

    // Client node: everything goes through the tunnel
    let client_routes = Arc::new(RouteTable::new(vec![Route::new(
        "^/",
        &format!("peer://{}", SERVER),
    )
    .unwrap()]));
    let client_hub = Hub::new();
    let direct = Arc::new(DirectProxy::new(Duration::from_secs(5)));
    let handler = Arc::new(LocalHandler::new(Arc::clone(&client_routes), direct.clone()));
    let _client = start_client(tunnel_addr, CLIENT, &client_hub, handler);
    wait_for_peer(&client_hub, SERVER).await;

    let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front.local_addr().unwrap();
    let app = router(HttpState {
        routes: client_routes,
        forwarder: Arc::new(Forwarder::new(
            Arc::clone(&client_hub),
            direct,
            Duration::from_secs(5),
        )),
        max_body_size: 1024,
    });
    tokio::spawn(async move { axum::serve(front, app).await.unwrap() });

    let http: HttpClient<_, Full<Bytes>> = HttpClient::builder(TokioExecutor::new()).build_http();

    let response = http
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("http://{}/api/orders", front_addr))
                .body(Full::new(Bytes::from("order-42")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"accepted order-42");

    // No route on the server node: refused there, reported as a bad gateway here
    let response = http
        .request(
            Request::builder()
                .uri(format!("http://{}/unknown", front_addr))
                .body(Full::new(Bytes::new()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
