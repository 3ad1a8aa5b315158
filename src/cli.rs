use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the DDS broker on a single UDP socket.
    Broker(BrokerArgs),
    /// Connect to a broker, watch variables, and publish from stdin.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker binds to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:4444")]
    pub listen: SocketAddr,

    /// Seconds of silence after which a peer is dropped.
    #[arg(long, default_value_t = 3.0)]
    pub ttl: f64,

    /// Scheduler tick period in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the broker to talk to.
    #[arg(long, default_value = "127.0.0.1:4444")]
    pub server: SocketAddr,

    /// Variable name to subscribe to (repeatable).
    #[arg(long = "subscribe", value_name = "NAME")]
    pub subscribe: Vec<String>,
}
