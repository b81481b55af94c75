//! Bifrost router
//!
//! Routes inbound HTTP requests by path to plain HTTP targets or, through
//! persistent tunnels, to other bifrost nodes.

use anyhow::{Context, Result};
use bifrost::{
    config::{generate_example_config, Config},
    proxy::{router, DirectProxy, HttpState, LocalHandler},
    transport::serve_tunnels,
    tunnel::{Client, Forwarder, Hub, RequestHandler},
    VERSION,
};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Bifrost - path-based HTTP router with peer tunnels
#[derive(Parser, Debug)]
#[command(name = "bifrost")]
#[command(about = "Bifrost - path-based HTTP router with peer tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "bifrost.toml")]
    config: String,

    /// HTTP listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Peer tunnel address to connect to (overrides config)
    #[arg(short, long)]
    peer: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

fn init_logging(level: &str, format: &str) {
    let builder = tracing_subscriber::fmt().with_env_filter(level);

    match format {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example config")?;
        println!("{}", example);
        return Ok(());
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(peer) = args.peer {
        config.tunnel.peer = Some(peer);
    }

    init_logging(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    info!("Bifrost v{} starting as {}", VERSION, config.server.identity);

    let routes = Arc::new(config.route_table()?);
    info!("Loaded {} route(s)", routes.len());
    if config.tunnel.listen.is_none()
        && config.tunnel.peer.is_none()
        && config.routes.iter().any(|route| route.is_peer())
    {
        warn!("Peer routes configured but no tunnel listen address or peer; they will fail");
    }

    let identity = config.identity();
    let hub = Hub::new();
    let direct = Arc::new(DirectProxy::new(config.tunnel.exchange_timeout()));
    let handler: Arc<dyn RequestHandler> =
        Arc::new(LocalHandler::new(Arc::clone(&routes), direct.clone()));

    if let Some(addr) = &config.tunnel.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind tunnel listener on {}", addr))?;

        let acceptor = serve_tunnels(
            listener,
            identity.clone(),
            Arc::clone(&hub),
            Arc::clone(&handler),
            config.tunnel.transport(),
        );
        tokio::spawn(async move {
            if let Err(e) = acceptor.await {
                error!("Tunnel acceptor stopped: {}", e);
            }
        });
    }

    let client = config.tunnel.peer.as_ref().map(|peer| {
        Client::new(
            peer.clone(),
            identity.clone(),
            Arc::clone(&hub),
            Arc::clone(&handler),
        )
        .with_transport(config.tunnel.transport())
        .with_backoff(config.tunnel.backoff())
        .spawn()
    });

    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&hub),
        direct,
        config.tunnel.exchange_timeout(),
    ));
    let app = router(HttpState {
        routes,
        forwarder,
        max_body_size: config.server.max_body_size,
    });

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.server.listen))?;
    info!("HTTP front listening on {}", config.server.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    if let Some(client) = client {
        client.abort();
    }
    hub.close_all();
    info!("Bifrost stopped");

    Ok(())
}
