//! Gateway Server process entry point: CLI/config load, logger setup, and
//! the fan-out to each configured frontend, composed with `tokio::select!`
//! against a single `triggered` shutdown pair the way `main`/`Gateway::run`
//! compose shutdown around one `triggered::Listener`.

mod basic_station;
mod config;
mod connection;
mod error;
mod events;
mod grpc;
mod identity;
mod message;
mod mqtt;
mod network_server;
mod registry;
mod scheduler;
mod stats;
mod token;
mod udp;

use error::Result;
use events::EventPublisher;
use gs_core::FrequencyPlanStore;
use identity::InMemoryIdentityClient;
use network_server::{ChannelNetworkServerClient, NetworkServerClient};
use registry::{GatewayRegistry, RegistryConfig};
use scheduler::SchedulerConfig;
use slog::{error, info, o, Drain, Logger};
use std::sync::Arc;
use std::time::Duration;
use stats::NoopStatsStore;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "gateway_server", about = "Multi-protocol LoRaWAN Gateway Server")]
struct Cli {
    /// Path to a TOML config file layered over the built-in defaults.
    #[structopt(long, short = "c")]
    config: Option<String>,
    /// Emit logs as JSON-ish key=value text to a syslog-compatible sink
    /// instead of compact terminal output.
    #[structopt(long)]
    syslog: bool,
}

fn build_logger(syslog: bool) -> Logger {
    if syslog {
        match slog_syslog::unix_3164(slog_syslog::Facility::LOG_USER) {
            Ok(drain) => {
                let drain = slog_async::Async::new(std::sync::Mutex::new(drain).fuse()).build().fuse();
                return Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")));
            }
            Err(err) => {
                eprintln!("falling back to terminal logging, syslog unavailable: {err}");
            }
        }
    }
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
}

fn main() -> Result<()> {
    let cli = Cli::from_args();
    let logger = build_logger(cli.syslog);
    let _scope_guard = slog_scope::set_global_logger(logger.clone());
    slog_stdlog::init().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(cli, logger))
}

async fn run(cli: Cli, logger: Logger) -> Result<()> {
    let settings = config::Settings::load(cli.config.as_deref())?;
    info!(logger, "starting gateway server"; "version" => env!("CARGO_PKG_VERSION"));

    let frequency_plans = Arc::new(FrequencyPlanStore::with_defaults());
    let identity_client = Arc::new(InMemoryIdentityClient::new(settings.require_registered_gateways));
    let events = EventPublisher::default();

    let (uplinks_tx, mut uplinks_rx) = tokio::sync::mpsc::channel(256);
    let (statuses_tx, mut statuses_rx) = tokio::sync::mpsc::channel(256);
    let network_server: Arc<dyn NetworkServerClient> = Arc::new(ChannelNetworkServerClient::new(uplinks_tx, statuses_tx));

    let registry = Arc::new(GatewayRegistry::new(
        frequency_plans.clone(),
        identity_client,
        network_server,
        events,
        Arc::new(NoopStatsStore),
        RegistryConfig {
            scheduler: SchedulerConfig {
                schedule_late_time: settings.udp.schedule_late_time_ms,
                ..SchedulerConfig::default()
            },
            location_update_debounce: settings.update_gateway_location_debounce_ms,
        },
    ));

    let (shutdown_trigger, shutdown_listener) = triggered::trigger();

    // Sinks for the two external boundaries this crate doesn't implement: a
    // real deployment wires a Network Server client here; this process logs
    // what it would have forwarded.
    let sink_logger = logger.new(o!("module" => "network_server_sink"));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some((gateway, uplink)) = uplinks_rx.recv() => {
                    slog::debug!(sink_logger, "uplink forwarded"; "gateway" => gateway.to_string(), "bytes" => uplink.raw_payload.len());
                }
                Some((gateway, _status)) = statuses_rx.recv() => {
                    slog::debug!(sink_logger, "status forwarded"; "gateway" => gateway.to_string());
                }
                else => break,
            }
        }
    });

    let mut tasks = Vec::new();

    for (listen, frequency_plan_id) in settings.udp_listener_addrs() {
        let config = udp::UdpFrontendConfig {
            listen,
            frequency_plan_id,
            downlink_path_expires: settings.udp.downlink_path_expires_ms,
            connection_expires: settings.udp.connection_expires_ms,
            addr_change_block: settings.udp.addr_change_block_ms,
        };
        let frontend = udp::UdpFrontend::bind(config, registry.clone(), logger.clone()).await?;
        let shutdown = shutdown_listener.clone();
        tasks.push(tokio::spawn(async move { frontend.run(shutdown).await }));
    }

    {
        let config = mqtt::MqttFrontendConfig { listen: settings.mqtt.listen.parse()?, keep_alive_grace: Duration::from_secs(10) };
        let frontend = mqtt::MqttFrontend::bind(config, registry.clone(), logger.clone()).await?;
        let shutdown = shutdown_listener.clone();
        tasks.push(tokio::spawn(async move { frontend.run(shutdown).await }));
    }

    {
        let frontend = grpc::GrpcFrontend::new(registry.clone(), frequency_plans.clone(), logger.clone());
        let listen = settings.grpc.listen.parse()?;
        let shutdown = shutdown_listener.clone();
        tasks.push(tokio::spawn(async move { frontend.serve(listen, shutdown).await }));
    }

    {
        let config = basic_station::BasicStationFrontendConfig {
            listen: settings.basic_station.listen.parse()?,
            frequency_plan_id: gs_core::frequency_plan::EU_863_870.to_string(),
            ws_ping_interval: settings.basic_station.ws_ping_interval_ms,
        };
        let frontend = basic_station::BasicStationFrontend::new(registry.clone(), frequency_plans.clone(), config, logger.clone());
        let shutdown = shutdown_listener.clone();
        tasks.push(tokio::spawn(async move { frontend.serve(shutdown).await }));
    }

    {
        let registry = registry.clone();
        let debounce = settings.update_connection_stats_debounce_ms;
        let shutdown = shutdown_listener.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(debounce);
            loop {
                tokio::select! {
                    _ = shutdown.clone() => return Result::Ok(()),
                    _ = interval.tick() => registry.mirror_all_stats().await,
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await.ok();
    info!(logger, "shutdown signal received");
    shutdown_trigger.trigger();

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(logger, "frontend task exited with error: {err}"),
            Err(err) => error!(logger, "frontend task panicked: {err}"),
        }
    }
    Ok(())
}

impl From<std::net::AddrParseError> for error::Error {
    fn from(e: std::net::AddrParseError) -> Self {
        error::Error::InvalidArgument(e.to_string())
    }
}
