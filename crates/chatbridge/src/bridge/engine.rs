//! Public face of the bridge: start/stop sequencing and status reads.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::dispatcher::{Command, Dispatcher, StartTicket};
use super::error::BridgeError;
use super::events::{BridgeEvent, EventBus, Subscription};
use super::state::BridgeStatus;
use crate::assistant::AssistantClient;
use crate::config::BridgeConfig;
use crate::gateway::{ChatGateway, GatewayCredentials};

/// How long the pre-start probe waits for a connection to the assistant port.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Routes messages between a chat gateway and an assistant client.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct BridgeEngine {
    gateway: Arc<dyn ChatGateway>,
    assistant: Arc<dyn AssistantClient>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<BridgeStatus>,
    events: EventBus,
    /// Held for the whole of `start`, including its cleanup.
    starting: Mutex<()>,
}

impl BridgeEngine {
    /// Create an idle engine. Must be called within a Tokio runtime.
    pub fn new(gateway: Arc<dyn ChatGateway>, assistant: Arc<dyn AssistantClient>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(BridgeStatus::default());
        let events = EventBus::new();

        let dispatcher = Dispatcher::new(
            gateway.clone(),
            assistant.clone(),
            events.clone(),
            status_tx,
            commands.downgrade(),
        );
        tokio::spawn(dispatcher.run(command_rx));

        Self {
            gateway,
            assistant,
            commands,
            status,
            events,
            starting: Mutex::new(()),
        }
    }

    /// Start both leaves and begin routing.
    ///
    /// Resolves once the bridge is `connected`. On failure the bridge is left
    /// in `error` with both leaves stopped; a concurrent [`stop`](Self::stop)
    /// makes this return [`BridgeError::Aborted`].
    pub async fn start(&self, config: &BridgeConfig) -> Result<(), BridgeError> {
        config.validate().map_err(BridgeError::ConfigInvalid)?;

        // Starts never overlap, including the cleanup of an aborted one
        let _starting = match self.starting.try_lock() {
            Ok(guard) => guard,
            Err(_) if self.status().state.is_running() => {
                return Err(BridgeError::AlreadyRunning);
            }
            Err(_) => self.starting.lock().await,
        };

        let token = CancellationToken::new();
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::BeginStart {
            routing: config.bridge.clone(),
            token: token.clone(),
            reply,
        })?;
        let StartTicket { epoch, recovering } =
            reply_rx.await.map_err(|_| BridgeError::Shutdown)??;

        if recovering {
            // Leaves of the failed run are still up; the assistant holds its port
            info!(epoch, "Stopping leaves left over from the failed run");
            self.stop_leaves().await;
        }

        info!(
            epoch,
            assistant_port = config.assistant.port,
            "Starting bridge"
        );

        match self.run_start(config, epoch, &token).await {
            Ok(()) => {
                info!(epoch, "Bridge connected");
                Ok(())
            }
            Err(_) if token.is_cancelled() => {
                info!(epoch, "Bridge start aborted by stop");
                // A leaf may have stored its process after stop() looked
                self.stop_leaves().await;
                Err(BridgeError::Aborted)
            }
            Err(e) => {
                warn!(epoch, error = %e, "Bridge start failed");
                let (reply, reply_rx) = oneshot::channel();
                if self
                    .send(Command::StartFailed {
                        epoch,
                        error: e.to_string(),
                        reply,
                    })
                    .is_ok()
                {
                    let _ = reply_rx.await;
                }
                self.stop_leaves().await;
                Err(e)
            }
        }
    }

    async fn run_start(
        &self,
        config: &BridgeConfig,
        epoch: u64,
        token: &CancellationToken,
    ) -> Result<(), BridgeError> {
        ensure_port_free(&config.assistant.host, config.assistant.port).await?;

        let credentials = GatewayCredentials {
            app_id: config.gateway.app_id.clone(),
            app_secret: config.gateway.app_secret.clone(),
        };
        abortable(token, self.gateway.start(&credentials)).await?;
        abortable(token, self.assistant.start(&config.assistant)).await?;
        abortable(token, self.assistant.open_event_stream()).await?;

        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::StartCompleted {
            epoch,
            gateway_connected: self.gateway.is_connected(),
            assistant_connected: self.assistant.is_connected(),
            reply,
        })?;
        reply_rx.await.map_err(|_| BridgeError::Shutdown)?
    }

    /// Return to `idle` and stop both leaves.
    ///
    /// Session map, retry queue and dedup windows are cleared before the
    /// leaves are stopped. Leaf stop failures are logged, never returned.
    pub async fn stop(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self.send(Command::Stop { reply }).is_ok() {
            let _ = reply_rx.await;
        }
        self.stop_leaves().await;
        info!("Bridge stopped");
    }

    async fn stop_leaves(&self) {
        let (gateway, assistant) = tokio::join!(self.gateway.stop(), self.assistant.stop());
        if let Err(e) = gateway {
            warn!(error = %e, "Failed to stop gateway");
        }
        if let Err(e) = assistant {
            warn!(error = %e, "Failed to stop assistant");
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    /// Register a callback for bridge events.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    fn send(&self, command: Command) -> Result<(), BridgeError> {
        self.commands
            .send(command)
            .map_err(|_| BridgeError::Shutdown)
    }
}

/// Run `fut` unless `token` is cancelled first.
async fn abortable<T, E>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, BridgeError>
where
    BridgeError: From<E>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(BridgeError::Aborted),
        result = fut => result.map_err(BridgeError::from),
    }
}

/// Fail fast if something is already listening where the assistant will bind.
async fn ensure_port_free(host: &str, port: u16) -> Result<(), BridgeError> {
    match tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Err(BridgeError::PortInUse {
            host: host.to_string(),
            port,
        }),
        _ => Ok(()),
    }
}
