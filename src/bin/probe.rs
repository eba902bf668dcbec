use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use pltester::probe::{self, ProbeConfig};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Measure data-channel packet loss and latency against a pltester server
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Signaling endpoint
    #[arg(long, default_value = "ws://127.0.0.1:52611/ws")]
    url: String,

    /// Packets per second
    #[arg(long, default_value_t = 32)]
    frequency: u32,

    /// Seconds to keep sending
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Minimum packet size in bytes
    #[arg(long, default_value_t = 0)]
    size: usize,

    /// Local address for the probe's UDP socket. If not given, auto-detects from network interfaces.
    #[arg(long)]
    bind_ip: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    pltester::init_crypto();

    let cli = Cli::parse();
    let bind_ip = match cli.bind_ip {
        Some(ip) => ip,
        None => pltester::detect_local_ip()?,
    };

    let config = ProbeConfig {
        frequency: cli.frequency,
        duration: Duration::from_secs(cli.duration),
        packet_size: cli.size,
        bind_ip,
        ..ProbeConfig::default()
    };

    let report = probe::run_probe(&cli.url, &config).await?;
    println!("{report}");
    Ok(())
}
