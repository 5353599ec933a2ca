use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use turn_relay::{init_logging, RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "TURN relay server", long_about = None)]
struct Args {
    /// Public IP address clients and peers reach this relay on
    #[arg(long, default_value = "127.0.0.1")]
    public_ip: IpAddr,

    /// UDP listening port
    #[arg(short, long, default_value_t = 3478)]
    port: u16,

    /// Authentication realm
    #[arg(long, default_value = "turn-relay")]
    realm: String,

    /// Shared secret for time-limited credentials
    #[arg(long, env = "TURN_SHARED_SECRET")]
    secret: String,

    /// First relay port to hand out
    #[arg(long, default_value_t = 49152)]
    min_relay_port: u16,

    /// Last relay port to hand out
    #[arg(long, default_value_t = 65535)]
    max_relay_port: u16,

    /// Default allocation lifetime in seconds
    #[arg(long, default_value_t = 600)]
    lifetime: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if args.min_relay_port > args.max_relay_port {
        bail!(
            "invalid relay port range {}-{}",
            args.min_relay_port,
            args.max_relay_port
        );
    }

    let config = RelayConfig {
        public_ip: args.public_ip,
        port: args.port,
        realm: args.realm,
        shared_secret: args.secret,
        relay_ports: (args.min_relay_port, args.max_relay_port),
        default_lifetime: Duration::from_secs(args.lifetime),
        ..RelayConfig::default()
    };

    let server = Arc::new(RelayServer::new(config).await?);
    server.run().await?;
    Ok(())
}
