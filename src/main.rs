use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use swarm_dds::{
    broker::{Broker, BrokerConfig},
    cli::{Cli, Command},
    client,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => {
            let broker = Broker::bind(BrokerConfig {
                listen: args.listen,
                ttl_secs: args.ttl,
                tick: Duration::from_millis(args.tick_ms),
            })
            .await?;
            info!("broker listening on {}", broker.local_addr()?);
            if let Err(err) = broker.run_until_ctrl_c().await {
                warn!("broker exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
