use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use pltester::config::DEFAULT_CONFIG_PATH;
use pltester::{Config, RandomIds, Registry, RtcAdapter, RtcEngineConfig, SessionContext};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// WebRTC data-channel signaling relay for latency and loss testing
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// JSON config file. Created with defaults if it does not exist.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// WebSocket port for signaling (overrides the config file)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Public IP advertised with a 1:1 NAT mapping (overrides config and PUBLIC_IP)
    #[arg(long)]
    public_ip: Option<IpAddr>,

    /// Local address peer sockets bind to. If not given, auto-detects from network interfaces.
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// First UDP port for peers (0 = OS-assigned)
    #[arg(long)]
    udp_port_min: Option<u16>,

    /// Last UDP port for peers (0 = OS-assigned)
    #[arg(long)]
    udp_port_max: Option<u16>,

    /// Run peers in ICE-lite mode
    #[arg(long)]
    ice_lite: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(ip) = self.public_ip {
            config.public_ip = Some(ip);
        }
        if let Some(ip) = self.bind_ip {
            config.bind_ip = Some(ip);
        }
        if let Some(port) = self.udp_port_min {
            config.udp_port_min = port;
        }
        if let Some(port) = self.udp_port_max {
            config.udp_port_max = port;
        }
        config.ice_lite |= self.ice_lite;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    pltester::init_crypto();

    let cli = Cli::parse();

    let mut config = Config::load_or_create(&cli.config)?.with_env_public_ip()?;
    cli.apply(&mut config);
    config.validate()?;

    let bind_ip = match config.bind_ip {
        Some(ip) => ip,
        None => pltester::detect_local_ip()?,
    };
    let nat = config.nat_config();
    if nat.direct_mapping() {
        info!("Public IP and port range set, skipping STUN");
    }

    let shutdown = CancellationToken::new();
    let ctx = SessionContext {
        registry: Arc::new(Registry::new()),
        engines: Arc::new(RtcAdapter::new(RtcEngineConfig {
            bind_ip,
            stun_servers: config.effective_stun_servers(),
            ice_lite: config.ice_lite,
        })),
        ids: Arc::new(RandomIds),
        nat,
        limits: config.limits(),
        shutdown: shutdown.clone(),
    };

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;

    println!(
        "SERVER READY ws://{bind_ip}:{}{}",
        config.listen_port, config.signaling_path
    );
    info!(
        listen_port = config.listen_port,
        %bind_ip,
        public_ip = ?config.public_ip,
        udp_ports = ?config.udp_port_range(),
        "Starting server"
    );

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => warn!("Unable to listen for shutdown signal: {e}"),
        }
    });

    pltester::server::run_server(
        listener,
        ctx,
        config.origin_policy(),
        config.signaling_path.clone(),
    )
    .await?;
    Ok(())
}
