use std::{net::IpAddr, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{endpoint::DEFAULT_GATE, relay::DEFAULT_POLL_INTERVAL_MS};

pub const DEFAULT_PORT: u16 = 7777;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay stdin/stdout over gate channels", long_about = None)]
pub struct Cli {
    /// Role to run. Required.
    #[arg(long, value_enum, env = "SOCKCHAT_MODE")]
    pub mode: Option<Mode>,

    /// Address the server listens on.
    #[arg(long, default_value = "0.0.0.0", env = "SOCKCHAT_LISTEN_IP")]
    pub listen_ip: IpAddr,

    /// Listener port number.
    #[arg(long, default_value_t = DEFAULT_PORT, env = "SOCKCHAT_LISTEN_PORT")]
    pub listen_port: u16,

    /// Host of the server to connect to.
    #[arg(long, default_value = "127.0.0.1", env = "SOCKCHAT_CONNECT_IP")]
    pub connect_ip: String,

    /// Target connection port.
    #[arg(long, default_value_t = DEFAULT_PORT, env = "SOCKCHAT_CONNECT_PORT")]
    pub connect_port: u16,

    /// Gate path clients must request.
    #[arg(long, default_value = DEFAULT_GATE, env = "SOCKCHAT_GATE")]
    pub gate: String,

    /// Delay between inbound polling sweeps, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS, env = "SOCKCHAT_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Refuse new clients once this many are connected.
    #[arg(long, env = "SOCKCHAT_MAX_CLIENTS")]
    pub max_clients: Option<usize>,

    /// Send random chatter instead of reading stdin.
    #[arg(long)]
    pub chatter: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl Cli {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
