//! External gateway run as a subprocess, spoken to over JSON Lines on stdio.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::{
    ChatGateway, GatewayCommand, GatewayCredentials, GatewayError, GatewayEvent, error_codes,
};
use crate::config::GatewayConfig;

/// How long `stop` waits for the gateway to exit after `shutdown`.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// How long `send_message` waits for `command_ok` / `command_failed`.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;

type PendingReply = oneshot::Sender<Result<(), GatewayError>>;

/// State shared with the stdout reader task.
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    pending: DashMap<String, PendingReply>,
}

impl Shared {
    fn fail_pending(&self, error: &GatewayError) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }
}

struct Process {
    child: Child,
    reader: JoinHandle<()>,
    cancel: CancellationToken,
}

/// [`ChatGateway`] backed by an external gateway program.
pub struct SubprocessGateway {
    command: String,
    args: Vec<String>,
    ready_timeout: Duration,
    events: broadcast::Sender<GatewayEvent>,
    shared: Arc<Shared>,
    stdin: Mutex<Option<ChildStdin>>,
    process: Mutex<Option<Process>>,
}

impl SubprocessGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            ready_timeout: Duration::from_secs(config.ready_timeout_seconds),
            events,
            shared: Arc::new(Shared::default()),
            stdin: Mutex::new(None),
            process: Mutex::new(None),
        }
    }

    async fn write_command(&self, command: &GatewayCommand) -> Result<(), GatewayError> {
        let mut line =
            serde_json::to_string(command).map_err(|e| GatewayError::Io(e.to_string()))?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(GatewayError::NotRunning)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))
    }

    /// Spawn the gateway program and the stdout reader.
    async fn spawn_process(&self) -> Result<(), GatewayError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::SpawnFailed(format!("{}: {}", self.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::SpawnFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::SpawnFailed("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        info!(pid = ?child.id(), command = %self.command, "Gateway process spawned");

        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_events(
            stdout,
            self.events.clone(),
            self.shared.clone(),
            cancel.clone(),
        ));

        *self.stdin.lock().await = Some(stdin);
        *self.process.lock().await = Some(Process {
            child,
            reader,
            cancel,
        });
        Ok(())
    }

    async fn connect(
        &self,
        credentials: &GatewayCredentials,
        events: &mut broadcast::Receiver<GatewayEvent>,
    ) -> Result<(), GatewayError> {
        self.write_command(&GatewayCommand::Start {
            app_id: credentials.app_id.clone(),
            app_secret: credentials.app_secret.clone(),
        })
        .await?;

        match tokio::time::timeout(self.ready_timeout, wait_for_connected(events)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::StartupTimeout(self.ready_timeout)),
        }
    }
}

#[async_trait]
impl ChatGateway for SubprocessGateway {
    async fn start(&self, credentials: &GatewayCredentials) -> Result<(), GatewayError> {
        self.stop().await?;

        // Subscribe before the reader exists so `connected` cannot be missed
        let mut events = self.events.subscribe();
        self.spawn_process().await?;

        if let Err(e) = self.connect(credentials, &mut events).await {
            warn!(error = %e, "Gateway failed to connect");
            if let Err(stop_err) = self.stop().await {
                warn!(error = %stop_err, "Failed to stop gateway after failed start");
            }
            return Err(e);
        }

        info!("Gateway connected");
        Ok(())
    }

    async fn stop(&self) -> Result<(), GatewayError> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };

        // Deliberate shutdown: silence the reader before the pipe closes
        process.cancel.cancel();
        if let Err(e) = self.write_command(&GatewayCommand::Shutdown).await {
            debug!(error = %e, "Could not deliver shutdown to gateway");
        }
        self.stdin.lock().await.take();

        match tokio::time::timeout(STOP_GRACE, process.child.wait()).await {
            Ok(Ok(status)) => debug!(exit_code = ?status.code(), "Gateway process exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait on gateway process"),
            Err(_) => {
                warn!(grace = ?STOP_GRACE, "Gateway ignored shutdown, killing");
                if let Err(e) = process.child.kill().await {
                    warn!(error = %e, "Failed to kill gateway process");
                }
            }
        }
        let _ = process.reader.await;

        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared
            .fail_pending(&GatewayError::Exited("gateway stopped".to_string()));
        info!("Gateway stopped");
        Ok(())
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), GatewayError> {
        let request_id = Ulid::new().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.insert(request_id.clone(), reply_tx);

        let command = GatewayCommand::SendMessage {
            request_id: request_id.clone(),
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        };
        if let Err(e) = self.write_command(&command).await {
            self.shared.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(SEND_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Exited(
                "gateway exited before acknowledging".to_string(),
            )),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                Err(GatewayError::SendFailed {
                    code: error_codes::SEND_FAILED.to_string(),
                    message: format!("no acknowledgement within {:?}", SEND_TIMEOUT),
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Reader
// ============================================================================

async fn wait_for_connected(
    events: &mut broadcast::Receiver<GatewayEvent>,
) -> Result<(), GatewayError> {
    loop {
        match events.recv().await {
            Ok(GatewayEvent::Connected) => return Ok(()),
            Ok(GatewayEvent::Error {
                code,
                message,
                fatal: true,
            }) => {
                return Err(if code == error_codes::AUTH_FAILED {
                    GatewayError::AuthFailed(message)
                } else {
                    GatewayError::Fatal { code, message }
                });
            }
            Ok(GatewayEvent::Disconnected { reason }) => {
                return Err(GatewayError::Exited(
                    reason.unwrap_or_else(|| "disconnected during startup".to_string()),
                ));
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                return Err(GatewayError::Exited("event channel closed".to_string()));
            }
        }
    }
}

async fn read_events(
    stdout: ChildStdout,
    events: broadcast::Sender<GatewayEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<GatewayEvent>(line) {
                    Ok(event) => handle_event(event, &events, &shared),
                    Err(e) => warn!(error = %e, line, "Ignoring malformed gateway event"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from gateway");
                break;
            }
        }
    }

    // The gateway went away on its own
    shared.connected.store(false, Ordering::SeqCst);
    shared.fail_pending(&GatewayError::Exited("gateway process exited".to_string()));
    let _ = events.send(GatewayEvent::Disconnected {
        reason: Some("gateway process exited".to_string()),
    });
}

fn handle_event(event: GatewayEvent, events: &broadcast::Sender<GatewayEvent>, shared: &Shared) {
    match event {
        GatewayEvent::CommandOk { request_id } => {
            if let Some((_, reply)) = shared.pending.remove(&request_id) {
                let _ = reply.send(Ok(()));
            }
        }
        GatewayEvent::CommandFailed {
            request_id,
            code,
            message,
        } => {
            if let Some((_, reply)) = shared.pending.remove(&request_id) {
                let _ = reply.send(Err(GatewayError::SendFailed { code, message }));
            }
        }
        event => {
            match &event {
                GatewayEvent::Ready {
                    gateway,
                    protocol_version,
                } => info!(gateway = %gateway, protocol_version = ?protocol_version, "Gateway ready"),
                GatewayEvent::Connected => shared.connected.store(true, Ordering::SeqCst),
                GatewayEvent::Disconnected { .. } | GatewayEvent::Error { fatal: true, .. } => {
                    shared.connected.store(false, Ordering::SeqCst)
                }
                _ => {}
            }
            let _ = events.send(event);
        }
    }
}

fn forward_stderr<R>(reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "chatbridge::gateway::output", "{}", line);
        }
    });
}

// ============================================================================
// Tests
// ============================================================================
