use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    BridgeConfig, DEFAULT_BAUD_RATE, DEFAULT_DEVICE_QUEUE_CAPACITY,
    DEFAULT_SESSION_QUEUE_CAPACITY, DeviceConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bridge a single TCP client to a serial device.
    Serve(ServeArgs),
    /// Connect to a bridge and exchange raw bytes with the device from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to accept clients on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Serial device path or name, e.g. /dev/ttyUSB0 or COM3.
    #[arg(long)]
    pub device: String,

    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// Serial read timeout in milliseconds; 0 blocks until data arrives.
    #[arg(long, default_value_t = 0)]
    pub read_timeout_ms: u64,

    /// Chunks a client may fall behind before it is disconnected.
    #[arg(long, default_value_t = DEFAULT_SESSION_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_DEVICE_QUEUE_CAPACITY)]
    pub device_queue_capacity: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the bridge to connect to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,
}

impl From<ServeArgs> for BridgeConfig {
    fn from(args: ServeArgs) -> Self {
        BridgeConfig {
            listen: args.listen,
            device: DeviceConfig {
                path: args.device,
                baud_rate: args.baud,
                read_timeout: Duration::from_millis(args.read_timeout_ms),
            },
            session_queue_capacity: args.queue_capacity,
            device_queue_capacity: args.device_queue_capacity,
        }
    }
}
