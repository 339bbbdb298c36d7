use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chatbridge::assistant::AssistantProcessClient;
use chatbridge::bridge::{BridgeEngine, BridgeEvent, Direction};
use chatbridge::config::Config;
use chatbridge::gateway::SubprocessGateway;
use chatbridge::server::{AppState, build_app};

#[derive(Parser)]
#[command(name = "chatbridge", version, about = "Bridge a chat platform to a local AI assistant")]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "chatbridge.yaml")]
    config: PathBuf,

    /// Serve the control plane without starting the bridge
    #[arg(long)]
    no_autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let gateway = Arc::new(SubprocessGateway::new(&config.gateway));
    let assistant = Arc::new(AssistantProcessClient::new());
    let engine = Arc::new(BridgeEngine::new(gateway, assistant));

    let _log_events = engine.subscribe(log_event);

    let bridge_config = config.bridge_config();
    if !cli.no_autostart {
        // A failed start leaves the bridge in `error`; it can be retried
        // through the control plane.
        if let Err(e) = engine.start(&bridge_config).await {
            error!(error = %e, kind = e.kind(), "Failed to start bridge");
        }
    }

    let app = build_app(
        AppState {
            engine: engine.clone(),
            bridge_config: Arc::new(bridge_config),
        },
        config.server.request_timeout_seconds,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "Control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control plane server failed")?;

    info!("Shutting down");
    engine.stop().await;
    Ok(())
}

fn log_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::Message {
            direction,
            chat_id,
            text,
        } => {
            let arrow = match direction {
                Direction::ToAssistant => "chat -> assistant",
                Direction::ToChat => "assistant -> chat",
            };
            info!(chat_id = ?chat_id, chars = text.chars().count(), "{}", arrow);
        }
        BridgeEvent::StatusChange(status) => {
            info!(
                state = %status.state,
                gateway = status.gateway_connected,
                assistant = status.assistant_connected,
                queue_depth = status.retry_queue_depth,
                sessions = status.active_sessions,
                "Bridge status"
            );
        }
        BridgeEvent::Error { message } => warn!(message = %message, "Bridge error"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
