// gossip-node
//
// Demo binary: joins a cluster, runs the failure detector, and leaves
// gracefully on SIGINT/SIGTERM.

use clap::Parser;
use rusty_gossip::transport::{TcpConfig, TcpTransport, Transport, UdpConfig, UdpTransport};
use rusty_gossip::{
    GossipError, MembershipConfig, MembershipEngine, MembershipMetrics, Result, RttTracker,
    Scheduler, VERSION,
};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gossip-node", version, about = "SWIM cluster membership node")]
struct Args {
    /// Local listen address for UDP and TCP.
    #[arg(long, default_value = "127.0.0.1:7946")]
    bind_address: SocketAddr,

    /// Address broadcast to peers; defaults to the bind address.
    #[arg(long)]
    advertise_address: Option<SocketAddr>,

    /// Bootstrap member; repeat for multiple seeds.
    #[arg(long = "member")]
    members: Vec<SocketAddr>,

    /// Protocol period in milliseconds.
    #[arg(long = "protocol-period", value_name = "MILLIS", default_value_t = 1000)]
    protocol_period_ms: u64,

    /// Expected direct-ping round trip in milliseconds; seeds the RTT
    /// tracker.
    #[arg(long = "direct-ping-timeout", value_name = "MILLIS", default_value_t = 200)]
    direct_ping_timeout_ms: u64,

    /// Piggyback truncation threshold in bytes.
    #[arg(long, default_value_t = 512)]
    max_datagram_length: usize,

    /// Log level: error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbosity.parse::<tracing::Level>() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("invalid verbosity: {}", args.verbosity);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gossip-node failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!(version = VERSION, "starting gossip-node");

    let advertised = args.advertise_address.unwrap_or(args.bind_address);
    let mut config = MembershipConfig {
        advertised_address: advertised,
        bind_address: args.bind_address,
        bootstrap_members: args.members.clone(),
        protocol_period: Duration::from_millis(args.protocol_period_ms),
        max_datagram_length_send: args.max_datagram_length,
        ..Default::default()
    };
    config.rtt.default_rtt = Duration::from_millis(args.direct_ping_timeout_ms);

    let metrics = Arc::new(MembershipMetrics::new());
    let rtt = Arc::new(RttTracker::new(config.rtt.clone()));

    let udp = Arc::new(UdpTransport::new(UdpConfig {
        bind_addr: config.bind_address,
        ..Default::default()
    }));
    let tcp = Arc::new(TcpTransport::new(TcpConfig {
        bind_addr: config.bind_address,
        ..Default::default()
    }));

    let protocol_period = config.protocol_period;
    let max_sleep_duration = config.max_sleep_duration;
    let list_request_interval = config.list_request_interval;

    let engine = Arc::new(MembershipEngine::new(
        config,
        udp.clone(),
        tcp.clone(),
        rtt.clone(),
        metrics.clone(),
    )?);

    udp.startup(engine.clone()).await?;
    tcp.startup(engine.clone()).await?;

    let mut scheduler = Scheduler::new(
        engine.clone(),
        rtt,
        protocol_period,
        max_sleep_duration,
        list_request_interval,
    );
    scheduler.start().await?;

    info!(address = %engine.self_address(), "membership service running");

    wait_for_signal().await;
    info!("shutdown signal received");

    // Broadcast departure first, then close the transports.
    let result = scheduler.stop().await;
    udp.shutdown().await?;
    tcp.shutdown().await?;

    result.map_err(|e| GossipError::Shutdown(format!("departure broadcast failed: {}", e)))?;
    info!("clean shutdown");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
