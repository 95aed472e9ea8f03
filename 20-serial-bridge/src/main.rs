use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use serial_bridge::{
    bridge::Bridge,
    cli::{Cli, Command},
    client,
    config::BridgeConfig,
    device,
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
        Command::Serve(args) => {
            let config = BridgeConfig::from(args);
            config.validate()?;

            // Nothing can be served without the device, so open it first.
            let device = device::open(&config.device)?;
            let listener = TcpListener::bind(config.listen).await?;
            let bridge = Bridge::new(listener, device, config);
            let addr = bridge.local_addr()?;
            info!("bridge listening on {}", addr);
            if let Err(err) = bridge.run_until_ctrl_c().await {
                warn!("bridge exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
