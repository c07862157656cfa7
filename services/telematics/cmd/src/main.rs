//! Telematics gateway service binary.
//!
//! Wires the protocol registry, the session manager and the sweeper together,
//! logs session events and optionally replays a capture of device frames.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use telematics_protocol::{JsonReportProtocol, MessageContext, ProtocolRegistry, Transport};
use telematics_session::{
    ChannelListener, DeviceSessionManager, Gateway, GatewayError, SessionEvent,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::GatewayConfig;
use logging::GatewayLogFormatter;

/// Telematics device gateway
#[derive(Parser, Debug)]
#[command(name = "telematics", version, about = "Telematics device gateway core")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Session timeout override, e.g. 5m
    #[arg(long)]
    session_timeout: Option<humantime::Duration>,

    /// Sweep interval override, e.g. 30s
    #[arg(long)]
    sweep_interval: Option<humantime::Duration>,

    /// Replay newline-delimited frames from this file
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Device id announced for replayed frames
    #[arg(long, requires = "replay")]
    replay_device: Option<String>,

    /// Transport replayed frames arrive on (stream, datagram, pubsub, request_response)
    #[arg(long, default_value = "pubsub")]
    replay_transport: Transport,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("telematics={}", args.log_level).parse()?)
        .add_directive(format!("telematics_protocol={}", args.log_level).parse()?)
        .add_directive(format!("telematics_session={}", args.log_level).parse()?);

    let formatter = if std::env::var_os("NO_COLOR").is_some() {
        GatewayLogFormatter::plain("telematics")
    } else {
        GatewayLogFormatter::new("telematics")
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(formatter)
        .init();

    info!("Starting telematics gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load_from_file(&args.config)?;
    if let Some(timeout) = args.session_timeout {
        config.session_timeout_secs = Duration::from(timeout).as_secs();
    }
    if let Some(every) = args.sweep_interval {
        config.sweep_interval_secs = Duration::from(every).as_secs();
    }
    config.validate()?;

    info!(
        "Session config: realm={}, timeout={}s, idle_after={}s, sweep={}s, max_decode_errors={}, retention={}s",
        config.default_realm,
        config.session_timeout_secs,
        config.idle_after_secs,
        config.sweep_interval_secs,
        config.max_consecutive_decode_errors,
        config.connection_retention_secs
    );

    let registry = build_registry(&config)?;
    let manager = Arc::new(DeviceSessionManager::new());
    let (listener, events) = ChannelListener::new();
    manager.add_listener(Arc::new(listener));
    let event_task = tokio::spawn(log_session_events(events));

    let gateway = Gateway::new(Arc::new(registry), manager, config.session_config());
    let sweeper = gateway.spawn_sweeper(config.sweep_interval());

    if let Some(path) = &args.replay {
        replay(
            &gateway,
            path,
            args.replay_device.as_deref(),
            args.replay_transport,
        )
        .await?;
    }

    info!("Telematics gateway started. Waiting for Ctrl-C...");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    sweeper.abort();
    event_task.abort();
    info!(
        "Final state: {} sessions, {} connected devices",
        gateway.manager().active_session_count(),
        gateway.manager().connected_device_count()
    );
    Ok(())
}

fn build_registry(config: &GatewayConfig) -> anyhow::Result<ProtocolRegistry> {
    let mut registry = ProtocolRegistry::new();
    registry.register(Arc::new(
        JsonReportProtocol::default().with_transports(config.json_transports.clone()),
    ))?;
    registry.apply_priority_order(&config.protocol_priority)?;
    component_info!("registry", "Protocols in probe order: {:?}", registry.ids());
    Ok(registry)
}

async fn log_session_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Created {
                device_id,
                realm,
                protocol_id,
            } => component_info!(
                "sessions",
                "Session created: device={} realm={} protocol={}",
                device_id,
                realm,
                protocol_id
            ),
            SessionEvent::Message { device_id, message } => component_debug!(
                "sessions",
                "Message from {}: {} readings",
                device_id,
                message.len()
            ),
            SessionEvent::Disconnected { device_id } => {
                component_info!("sessions", "Device {} disconnected", device_id)
            }
            SessionEvent::Removed {
                device_id,
                message_count,
            } => component_info!(
                "sessions",
                "Session removed: device={} messages={}",
                device_id,
                message_count
            ),
            SessionEvent::CommandFailed { device_id, command } => component_warn!(
                "sessions",
                "Command '{}' for {} was not delivered",
                command,
                device_id
            ),
        }
    }
}

async fn replay(
    gateway: &Gateway,
    path: &Path,
    device_id: Option<&str>,
    transport: Transport,
) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read replay file {:?}", path))?;

    let mut context = MessageContext::new(transport);
    if let Some(device_id) = device_id {
        context = context.with_device_id(device_id);
    }

    let (mut decoded, mut failed, mut unclaimed) = (0usize, 0usize, 0usize);
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        // Connectionless transports carry no state between frames
        let mut frame_context = if transport.is_connection_oriented() {
            context.clone()
        } else {
            context.copy_for_new_message()
        };

        match gateway.ingest(line.as_bytes(), &mut frame_context) {
            Ok(report) if !report.is_claimed() => unclaimed += 1,
            Ok(report) => {
                decoded += report.decoded;
                failed += report.failed;
            }
            Err(GatewayError::TooManyDecodeErrors { count, .. }) => {
                component_error!(
                    "replay",
                    "Replay aborted at line {} after {} consecutive decode errors",
                    line_no + 1,
                    count
                );
                failed += 1;
                break;
            }
            Err(e) => return Err(e.into()),
        }

        if transport.is_connection_oriented() {
            context = frame_context;
        }
    }

    component_info!(
        "replay",
        "Replayed {:?}: decoded={} failed={} unclaimed={}",
        path,
        decoded,
        failed,
        unclaimed
    );
    Ok(())
}
