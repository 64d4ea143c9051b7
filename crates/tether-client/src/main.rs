//! Tether echo client and test server.
//!
//! `tether` (or `tether client`) opens the configured number of sessions and
//! sends a `TestEcho` on each one every interval. `tether echo-server`
//! answers those echoes for local runs.

mod echo_client;
mod echo_server;
mod error;
mod protocol;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tether_config::{CliArgs, Command, Config, NetworkConfig};
use tether_net::{
    BufferPool, Connector, ConnectorConfig, FrameConfig, Session, SessionConfig, SessionHandler,
    SocketConfig, TrafficCounters, TrafficMeter,
};
use tracing::{error, info, warn};

use crate::echo_client::{EchoClient, EchoStats};
use crate::echo_server::EchoServer;
use crate::error::AppError;

/// How often both modes log their counters and rates.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(|| dirs::config_dir().map(|dir| dir.join("tether")))
        .unwrap_or_else(|| PathBuf::from("."));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tether_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tether-io")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let command = args.command.clone().unwrap_or(Command::Client);
    let result = runtime.block_on(async {
        match command {
            Command::Client => run_client(&config).await,
            Command::EchoServer { bind } => run_echo_server(&config, bind).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_client(config: &Config) -> Result<(), AppError> {
    let endpoint = resolve(&config.network.endpoint()).await?;
    let stats = Arc::new(EchoStats::default());
    let handler: Arc<dyn SessionHandler> = Arc::new(EchoClient::new(
        config.client.echo_interval(),
        Arc::clone(&stats),
    ));
    let protocols = Arc::new(protocol::client_protocols());
    let session_config = session_config(&config.network);
    let traffic = Arc::clone(&session_config.traffic);

    let connector = Connector::new(connector_config(&config.network));
    let sessions = connector
        .connect(endpoint, move || {
            Session::new(
                Arc::clone(&handler),
                Arc::clone(&protocols),
                session_config.clone(),
            )
        })
        .await;
    if sessions.is_empty() {
        return Err(AppError::NoSessions(endpoint));
    }
    info!(
        connected = sessions.len(),
        requested = config.network.parallel_connects,
        "Echo client running on {endpoint}, Ctrl-C to stop"
    );

    let mut meter = TrafficMeter::new(traffic);
    let mut report = tokio::time::interval(STATS_INTERVAL);
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                info!(sent = stats.sent(), received = stats.received(), open = stats.open(), "echo stats");
                log_rates(&mut meter, stats.open());
                if stats.open() == 0 {
                    warn!("All sessions closed");
                    break;
                }
            }
        }
    }

    for session in &sessions {
        session.disconnect();
    }
    info!(sent = stats.sent(), received = stats.received(), "Echo client stopped");
    Ok(())
}

async fn run_echo_server(config: &Config, bind: Option<String>) -> Result<(), AppError> {
    let bind = bind.unwrap_or_else(|| format!("0.0.0.0:{}", config.network.server_port));
    let bind_addr = resolve(&bind).await?;
    let server = Arc::new(EchoServer::new(
        bind_addr,
        session_config(&config.network),
        socket_config(&config.network),
    ));

    let running = Arc::clone(&server);
    let mut accept_loop = tokio::spawn(async move { running.run().await });
    let mut meter = TrafficMeter::new(Arc::clone(server.traffic()));
    let mut report = tokio::time::interval(STATS_INTERVAL);
    report.tick().await;
    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break None,
            joined = &mut accept_loop => break Some(joined),
            _ = report.tick() => log_rates(&mut meter, server.live_sessions()),
        }
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            server.shutdown();
            accept_loop.await
        }
    };
    join_server(joined)
}

/// Log per-second rates since the previous report.
fn log_rates(meter: &mut TrafficMeter, live: usize) {
    let rates = meter.sample();
    let totals = meter.totals();
    info!(
        live,
        accept_tps = rates.accept_per_sec,
        recv_tps = rates.recv_per_sec,
        send_tps = rates.send_per_sec,
        accepted = totals.accepted,
        received = totals.frames_received,
        sent = totals.packets_sent,
        "throughput"
    );
}

fn join_server(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(AppError::Io(std::io::Error::other(e))),
    }
}

async fn resolve(endpoint: &str) -> Result<SocketAddr, AppError> {
    tokio::net::lookup_host(endpoint)
        .await
        .map_err(|source| AppError::Resolve {
            endpoint: endpoint.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| AppError::NoAddress(endpoint.to_string()))
}

fn socket_config(network: &NetworkConfig) -> SocketConfig {
    SocketConfig {
        tcp_nodelay: network.tcp_nodelay,
        keepalive_enabled: network.keepalive,
        ..Default::default()
    }
}

fn connector_config(network: &NetworkConfig) -> ConnectorConfig {
    ConnectorConfig {
        parallel: network.parallel_connects,
        connect_timeout: network.connect_timeout(),
        socket: socket_config(network),
    }
}

fn session_config(network: &NetworkConfig) -> SessionConfig {
    SessionConfig {
        send_batch_limit: network.send_batch_limit,
        frame: FrameConfig::default(),
        pool: BufferPool::new(network.buffer_capacity),
        traffic: Arc::new(TrafficCounters::new()),
    }
}
