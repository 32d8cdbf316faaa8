use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::io::AsyncWrite;
use tracing::info;

use crate::{
    endpoint::Endpoint,
    gate::{self, GateChannel, GateListener},
    input::LineSource,
    registry::Registry,
    relay::{FanInSettings, Relay},
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub gate: String,
    pub poll_interval: Duration,
    pub max_clients: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub poll_interval: Duration,
}

/// A bound server that has not started relaying yet.
pub struct Server {
    listener: GateListener,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = GateListener::bind(config.gate.clone(), config.listen)
            .await
            .with_context(|| format!("failed to start gate listener on {}", config.listen))?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients into the registry and relays until `shutdown`
    /// resolves or a loop fails.
    pub async fn run_until<S, W, F>(self, source: S, output: W, shutdown: F) -> Result<()>
    where
        S: LineSource,
        W: AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let Server { listener, config } = self;
        let registry: Arc<Registry<GateChannel>> =
            Arc::new(Registry::with_capacity_limit(config.max_clients));

        let accept_loop = listener.spawn(Arc::clone(&registry));
        let relay = Relay::new(
            registry,
            FanInSettings {
                poll_interval: config.poll_interval,
                stop_when_empty: false,
            },
        );

        let result = relay.run_until(source, output, shutdown).await;
        accept_loop.abort();
        result
    }
}

pub async fn run_server<S, W, F>(
    config: ServerConfig,
    source: S,
    output: W,
    shutdown: F,
) -> Result<()>
where
    S: LineSource,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()> + Send,
{
    info!("starting server mode on {}", config.listen);
    let server = Server::bind(config).await?;
    info!("gate listening on {}", server.local_addr()?);
    server.run_until(source, output, shutdown).await
}

/// Connects to the gate and relays with the single resulting channel until
/// the server goes away, `shutdown` resolves, or a loop fails.
pub async fn run_client<S, W, F>(
    config: ClientConfig,
    source: S,
    output: W,
    shutdown: F,
) -> Result<()>
where
    S: LineSource,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()> + Send,
{
    let url = config.endpoint.url();
    info!("connecting to controller on {}", config.endpoint.authority());
    info!("gate URI: {url}");

    let channel = gate::build_channel(&url)
        .await
        .with_context(|| format!("failed to build channel to {url}"))?
        .initialize_circuit()
        .await
        .context("failed to initialize circuit")?;
    info!(peer = %channel.peer(), "connected to server, beginning i/o");

    let registry = Arc::new(Registry::new());
    registry.register(Arc::new(channel)).await?;

    let relay = Relay::new(
        registry,
        FanInSettings {
            poll_interval: config.poll_interval,
            stop_when_empty: true,
        },
    );
    relay.run_until(source, output, shutdown).await
}
