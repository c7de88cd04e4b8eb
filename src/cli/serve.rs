use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use relay_core::{spawn_relay, IdlePolicy, RelayConfig, RelayHandle};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::server::{build_router, AuthPolicy, ServeState};

#[derive(Args, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1", env = "CDP_RELAY_HOST")]
    pub host: String,

    /// Port to bind
    #[arg(long, default_value_t = 19988, env = "CDP_RELAY_PORT")]
    pub port: u16,

    /// Shared auth token; mandatory when binding to a non-loopback address
    #[arg(long, env = "CDP_RELAY_TOKEN")]
    pub token: Option<String>,

    /// What to do with client traffic while no extension is connected
    #[arg(long = "on-idle", value_name = "reject|wait", env = "CDP_RELAY_ON_IDLE")]
    pub on_idle: Option<String>,

    /// Ask a prior instance on the same port to exit first
    #[arg(long)]
    pub replace: bool,
}

pub async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let ip: IpAddr = args
        .host
        .parse()
        .with_context(|| format!("invalid --host value '{}'", args.host))?;
    let bind = SocketAddr::new(ip, args.port);

    let idle_policy = match &args.on_idle {
        Some(raw) => IdlePolicy::parse(raw)
            .ok_or_else(|| anyhow!("invalid --on-idle value '{raw}' (expected reject|wait)"))?,
        None => RelayConfig::default().idle_policy,
    };
    let config = RelayConfig {
        bind,
        token: args.token.clone(),
        idle_policy,
        ..RelayConfig::default()
    };
    if config.is_public_bind() && config.token.is_none() {
        bail!("--token is required when binding to a non-loopback address");
    }

    if args.replace {
        replace_running_instance(&bind, args.token.as_deref()).await?;
    }

    let relay = spawn_relay(config.clone());
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let policy = config
        .token
        .as_deref()
        .map(|token| Arc::new(AuthPolicy::new(token)));
    if policy.is_none() {
        warn!("relay auth disabled; do not expose this port publicly");
    }
    let state = ServeState::new(relay.clone(), policy, shutdown_tx);
    let router = build_router(state);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind relay on {bind}"))?;
    info!("CDP relay listening at http://{bind}");
    info!("CDP endpoint: ws://{bind}/cdp/<id>");
    info!("Extension endpoint: ws://{bind}/extension");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(relay.clone(), shutdown_rx))
    .await
    .context("relay server exited unexpectedly")?;

    info!("relay stopped");
    Ok(())
}

/// Resolves when a stop is requested, after the relay has queued lifecycle
/// events and close frames toward every connection (extension last).
async fn shutdown_signal(relay: RelayHandle, mut trigger: mpsc::Receiver<()>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
        _ = trigger.recv() => info!("shutdown requested"),
    }

    relay.shutdown().await;
}

/// `--replace`: probe the port, post `/shutdown`, then wait for it to free.
async fn replace_running_instance(bind: &SocketAddr, token: Option<&str>) -> Result<()> {
    let base = format!("http://{bind}");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("building replace probe client")?;

    if client
        .get(format!("{base}/version"))
        .send()
        .await
        .is_err()
    {
        return Ok(());
    }

    info!("replacing running relay instance at {bind}");
    let mut request = client.post(format!("{base}/shutdown"));
    if let Some(token) = token {
        request = request.header("x-cdp-relay-token", token);
    }
    let _ = request.send().await;

    for _ in 0..50 {
        if TcpStream::connect(bind).await.is_err() {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
    bail!("previous instance on {bind} did not exit");
}
