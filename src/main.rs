use std::{
    error::Error,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use ilnp_overlay::{
    config::{ApplicationConfig, Config, ConfigError},
    link::Link,
    network::Network,
    transport::Socket,
};
use log::{debug, info, warn, LevelFilter};
use tokio::time::MissedTickBehavior;
#[cfg(target_family = "unix")]
use tokio::signal::{self, unix::SignalKind};

/// Config file used if none is given.
const DEFAULT_CONFIG_FILE: &str = "node.toml";

#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Path to the config file. Default [node.toml].
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Identifier of this node, overrides the config file.
    #[arg(long = "nid")]
    nid: Option<String>,

    /// Locator cycle of this node, e.g. "0:0:0:a,0:0:0:b-0:0:0:c". Overrides the config file.
    #[arg(long = "locators")]
    locators: Option<String>,

    /// Hostname to advertise, overrides the config file.
    #[arg(long = "hostname")]
    hostname: Option<String>,

    /// Enable debug logging. Does nothing if `--silent` is set.
    #[arg(short = 'd', long = "debug", default_value_t = false)]
    debug: bool,

    /// Disable all logs except error logs.
    #[arg(long = "silent", default_value_t = false)]
    silent: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let level = if cli.silent {
        LevelFilter::Error
    } else if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    pretty_env_logger::formatted_timed_builder()
        .filter_module("ilnp_overlay", level)
        .filter_module("ilnpd", level)
        .init();

    let mut config = Config::load(&cli.config)?;
    debug!("Loaded config file at {:?}", cli.config);
    if let Some(nid) = cli.nid {
        config.network.nid = Some(nid.parse().map_err(ConfigError::from)?);
    }
    if let Some(locators) = cli.locators {
        config.network.locators = locators.parse().map_err(ConfigError::from)?;
    }
    if let Some(hostname) = cli.hostname {
        config.discovery.hostname = hostname;
    }
    config.validate()?;

    run(config).await
}

#[cfg(target_os = "linux")]
async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    use ilnp_overlay::{link::multicast::MulticastLink, task::TaskSet, Node};

    let link = MulticastLink::bind(&config.link)?;
    let node = Node::new(link, &config)?;
    info!(
        "Node {} started with nid {} on {:?}",
        config.discovery.hostname,
        node.nid(),
        node.network().locators()
    );

    let mut applications = TaskSet::new();
    if let Some(app) = config.application.clone() {
        let socket = node.bind(app.port)?;
        applications.spawn(
            "heartbeat",
            heartbeat(socket, node.network().clone(), app),
        );
    }

    wait_for_shutdown().await;
    info!("Shutting down");

    drop(applications);
    drop(node);

    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: Config) -> Result<(), Box<dyn Error>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "the multicast link is only available on linux",
    )
    .into())
}

/// Periodically send a heartbeat to the configured peer, and log everything received.
async fn heartbeat<L: Link>(socket: Socket<L>, network: Network<L>, app: ApplicationConfig) {
    let mut ticker = tokio::time::interval(app.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                seq += 1;
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis();
                let message = format!("{seq} {millis}");
                let sent =
                    socket.send_to_host(&app.remote_hostname, app.remote_port, message.as_bytes());
                match sent {
                    Ok((dst, interface)) => {
                        debug!("Heartbeat {seq} sent to {dst} via {interface}")
                    }
                    Err(e) => {
                        warn!("Could not send heartbeat {seq} to {}: {e}", app.remote_hostname)
                    }
                }
            }
            datagram = socket.recv() => {
                let host = network
                    .gethostbyaddr(datagram.src)
                    .unwrap_or_else(|_| datagram.src.to_string());
                info!(
                    "Received \"{}\" from {host} ({}, port {:?}) via {}",
                    String::from_utf8_lossy(&datagram.payload),
                    datagram.src,
                    datagram.src_port,
                    datagram.interface
                );
            }
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(target_family = "unix")]
    {
        let mut sigint =
            signal::unix::signal(SignalKind::interrupt()).expect("Can install SIGINT handler");
        let mut sigterm =
            signal::unix::signal(SignalKind::terminate()).expect("Can install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => { }
            _ = sigterm.recv() => { }
        }
    }
    #[cfg(not(target_family = "unix"))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to wait for SIGINT: {e}");
        }
    }
}
