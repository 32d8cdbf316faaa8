use std::{io::IsTerminal, net::SocketAddr, process::ExitCode};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use sockchat::{
    cli::{Cli, Mode},
    endpoint::Endpoint,
    input::{Chatter, StdinLines},
    node::{self, ClientConfig, ServerConfig},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

fn main() -> ExitCode {
    init_tracing();
    info!("[welcome to sockchat]");

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = ?err, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    };

    // A stdin read may still be parked on a blocking thread; don't wait for it.
    runtime.shutdown_background();
    code
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let Some(mode) = cli.mode else {
        warn!("--mode must be either 'client' or 'server'; check usage with --help");
        return Ok(ExitCode::from(2));
    };

    let poll_interval = cli.poll_interval();
    let output = tokio::io::stdout();

    match mode {
        Mode::Server => {
            let config = ServerConfig {
                listen: SocketAddr::new(cli.listen_ip, cli.listen_port),
                gate: cli.gate,
                poll_interval,
                max_clients: cli.max_clients,
            };
            if cli.chatter {
                node::run_server(config, Chatter::new("Controller"), output, ctrl_c()).await?;
            } else {
                node::run_server(config, StdinLines::stdin(), output, ctrl_c()).await?;
            }
        }
        Mode::Client => {
            let config = ClientConfig {
                endpoint: Endpoint::new(cli.connect_ip, cli.connect_port, cli.gate),
                poll_interval,
            };
            if cli.chatter {
                node::run_client(config, Chatter::new("Client"), output, ctrl_c()).await?;
            } else {
                node::run_client(config, StdinLines::stdin(), output, ctrl_c()).await?;
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
