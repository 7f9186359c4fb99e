//! Beacon daemon - field-device telemetry agent.

mod simulate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use beacon_core::{init_logging, Config, Paths, TransportMode};
use beacon_dispatch::{
    run_command_loop, CommandHandler, DispatchConfig, Dispatcher, SystemControl,
};
use beacon_identity::IdentityManager;
use beacon_store::Store;
use beacon_transport::{HttpConfig, HttpTransport, MqttConfig, MqttTransport, TlsFiles, Transport};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Beacon agent command-line interface.
#[derive(Parser)]
#[command(name = "beacond")]
#[command(about = "Beacon field-device telemetry agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Base directory for runtime files (database, certificate, config).
    /// Defaults to ~/.beacon
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run,
    /// Run the agent and emit the reference waveform
    Simulate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;
    let config = Config::load(&paths)?;

    let simulate = matches!(cli.command, Some(Commands::Simulate));
    run_agent(config, paths, simulate).await
}

/// Reboot collaborator backed by the host's reboot command.
struct HostSystem;

impl SystemControl for HostSystem {
    fn reboot(&self) {
        warn!("Executing reboot");
        if let Err(e) = std::process::Command::new("reboot").spawn() {
            error!(error = %e, "Reboot command failed");
        }
    }
}

async fn run_agent(config: Config, paths: Paths, simulate: bool) -> anyhow::Result<()> {
    info!(
        device_id = %config.device_id,
        server = %config.server,
        transport = config.transport.as_str(),
        "Starting agent"
    );

    // Failure to open or migrate the outbox is the one fatal error.
    let store =
        Arc::new(Store::open(&paths.database_file()).context("opening the outbox store")?);

    let api_base = config.api_url()?;
    let identity = Arc::new(IdentityManager::new(
        &config.device_id,
        api_base.as_str(),
        paths.certificate_file(),
        paths.private_key_file(),
    ));

    let cancel = CancellationToken::new();

    let mut http_transport: Option<Arc<HttpTransport>> = None;
    let transport: Arc<dyn Transport> = match config.transport {
        TransportMode::Mqtt => {
            let mut mqtt_config =
                MqttConfig::new(&config.device_id, &config.server, config.mqtt_port);
            if config.use_tls {
                mqtt_config.tls = Some(TlsFiles {
                    ca: paths.ca_certificate_file(),
                    certificate: paths.certificate_file(),
                    key: paths.private_key_file(),
                });
            }
            MqttTransport::start(mqtt_config, store.clone(), cancel.child_token())?
        }
        TransportMode::Http => {
            let http = Arc::new(HttpTransport::new(
                HttpConfig::new(&config.device_id, api_base.as_str()),
                store.clone(),
                identity.clone(),
            ));
            http_transport = Some(http.clone());
            http
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        identity.clone(),
        transport.clone(),
        DispatchConfig {
            interval: Duration::from_millis(config.dispatch_interval_ms),
            batch_size: config.batch_size,
            claim_window: Duration::from_secs(config.claim_window_secs),
            ..DispatchConfig::default()
        },
    ));

    let handler = Arc::new(CommandHandler::new(store.clone(), Arc::new(HostSystem)));

    let dispatch_task = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    let command_task = {
        let transport = transport.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move { run_command_loop(handler, transport, cancel).await })
    };

    let simulate_task = if simulate {
        let store = store.clone();
        let cancel = cancel.child_token();
        Some(tokio::spawn(async move {
            simulate::run(store, http_transport, cancel).await;
        }))
    } else {
        None
    };

    wait_for_shutdown().await;
    info!("Shutting down");
    cancel.cancel();

    dispatch_task.await.ok();
    command_task.await.ok();
    if let Some(task) = simulate_task {
        task.await.ok();
    }

    store.persist().context("persisting the outbox store")?;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "Could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
