//! The dispatcher task: sole owner of all mutable bridge state.
//!
//! Everything that touches the session map, retry queue, dedup windows or
//! lifecycle state arrives here as a [`Command`]. Network I/O never runs on
//! this task; it is spawned and reports back with another command, tagged
//! with the run epoch so results from a previous run are ignored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::dedup::{SeenWindow, fingerprint};
use super::error::BridgeError;
use super::events::{BridgeEvent, EventBus};
use super::queue::{Direction, PendingMessage, RetryQueue};
use super::sessions::ChatSessionMap;
use super::state::{BridgeState, BridgeStatus};
use crate::assistant::{AssistantClient, AssistantError, AssistantEvent, AssistantMessage};
use crate::config::RoutingConfig;
use crate::gateway::{ChatGateway, GatewayEvent, MessageReceivedData};

pub(super) enum Command {
    /// Enter `connecting` and wire up forwarders for a new run.
    BeginStart {
        routing: RoutingConfig,
        token: CancellationToken,
        reply: oneshot::Sender<Result<StartTicket, BridgeError>>,
    },
    /// Both leaves started; settle on `connected` or `error`.
    StartCompleted {
        epoch: u64,
        gateway_connected: bool,
        assistant_connected: bool,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    StartFailed {
        epoch: u64,
        error: String,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Gateway {
        epoch: u64,
        event: GatewayEvent,
    },
    Assistant {
        epoch: u64,
        event: AssistantEvent,
    },
    SessionCreated {
        epoch: u64,
        chat_id: String,
        result: Result<String, AssistantError>,
    },
    DeliveryFailed {
        epoch: u64,
        message: PendingMessage,
        error: String,
    },
    DrainRetries {
        epoch: u64,
    },
}

/// Handed back by `BeginStart`.
pub(super) struct StartTicket {
    pub(super) epoch: u64,
    /// The previous run ended in `error` and its leaves were never stopped.
    pub(super) recovering: bool,
}

type CommandSender = mpsc::WeakUnboundedSender<Command>;

/// Post a command back to the dispatcher. Returns false once it is gone.
fn post(commands: &CommandSender, command: Command) -> bool {
    commands
        .upgrade()
        .is_some_and(|tx| tx.send(command).is_ok())
}

#[derive(Debug, Clone, Copy)]
enum Leaf {
    Gateway,
    Assistant,
}

impl Leaf {
    fn name(self) -> &'static str {
        match self {
            Leaf::Gateway => "gateway",
            Leaf::Assistant => "assistant",
        }
    }
}

pub(super) struct Dispatcher {
    gateway: Arc<dyn ChatGateway>,
    assistant: Arc<dyn AssistantClient>,
    events: EventBus,
    status: watch::Sender<BridgeStatus>,
    commands: CommandSender,

    epoch: u64,
    run: Option<CancellationToken>,
    routing: RoutingConfig,

    state: BridgeState,
    last_error: Option<String>,
    connected_since: Option<DateTime<Utc>>,
    gateway_connected: bool,
    assistant_connected: bool,

    sessions: ChatSessionMap,
    /// Chats whose session is being created, with the messages waiting for it.
    pending_sessions: HashMap<String, Vec<PendingMessage>>,
    queue: RetryQueue,
    seen_inbound: SeenWindow,
    seen_outbound: SeenWindow,
}

impl Dispatcher {
    pub(super) fn new(
        gateway: Arc<dyn ChatGateway>,
        assistant: Arc<dyn AssistantClient>,
        events: EventBus,
        status: watch::Sender<BridgeStatus>,
        commands: CommandSender,
    ) -> Self {
        let routing = RoutingConfig::default();
        Self {
            gateway,
            assistant,
            events,
            status,
            commands,
            epoch: 0,
            run: None,
            queue: RetryQueue::new(routing.retry_capacity),
            seen_inbound: SeenWindow::new(routing.dedup_capacity),
            seen_outbound: SeenWindow::new(routing.dedup_capacity),
            routing,
            state: BridgeState::Idle,
            last_error: None,
            connected_since: None,
            gateway_connected: false,
            assistant_connected: false,
            sessions: ChatSessionMap::new(),
            pending_sessions: HashMap::new(),
        }
    }

    /// Process commands until every strong sender is dropped.
    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        if let Some(token) = self.run.take() {
            token.cancel();
        }
        debug!("Bridge dispatcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::BeginStart {
                routing,
                token,
                reply,
            } => {
                let _ = reply.send(self.begin_start(routing, token));
            }
            Command::StartCompleted {
                epoch,
                gateway_connected,
                assistant_connected,
                reply,
            } => {
                let _ = reply.send(self.start_completed(
                    epoch,
                    gateway_connected,
                    assistant_connected,
                ));
            }
            Command::StartFailed {
                epoch,
                error,
                reply,
            } => {
                self.start_failed(epoch, error);
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Gateway { epoch, event } if self.is_current(epoch) => {
                self.on_gateway_event(event)
            }
            Command::Assistant { epoch, event } if self.is_current(epoch) => {
                self.on_assistant_event(event)
            }
            Command::SessionCreated {
                epoch,
                chat_id,
                result,
            } if self.is_current(epoch) => self.on_session_created(chat_id, result),
            Command::DeliveryFailed {
                epoch,
                message,
                error,
            } if self.is_current(epoch) => self.retry_or_drop(message, &error),
            Command::DrainRetries { epoch } if self.is_current(epoch) => self.drain_retries(),
            _ => trace!("Ignoring command from a previous run"),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.run.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn begin_start(
        &mut self,
        routing: RoutingConfig,
        token: CancellationToken,
    ) -> Result<StartTicket, BridgeError> {
        if self.state.is_running() {
            return Err(BridgeError::AlreadyRunning);
        }
        let recovering = self.state == BridgeState::Error;

        self.epoch += 1;
        if let Some(previous) = self.run.replace(token.clone()) {
            previous.cancel();
        }

        self.queue = RetryQueue::new(routing.retry_capacity);
        self.seen_inbound = SeenWindow::new(routing.dedup_capacity);
        self.seen_outbound = SeenWindow::new(routing.dedup_capacity);
        self.routing = routing;
        self.reset_run_state();
        self.state = BridgeState::Connecting;

        // Subscribe before either leaf starts so no early event is missed
        let epoch = self.epoch;
        forward(
            self.gateway.subscribe(),
            token.clone(),
            self.commands.clone(),
            "gateway",
            move |event| Command::Gateway { epoch, event },
        );
        forward(
            self.assistant.subscribe(),
            token.clone(),
            self.commands.clone(),
            "assistant",
            move |event| Command::Assistant { epoch, event },
        );
        spawn_drain_ticker(
            epoch,
            self.routing.retry_interval(),
            token,
            self.commands.clone(),
        );

        self.publish();
        Ok(StartTicket { epoch, recovering })
    }

    fn start_completed(
        &mut self,
        epoch: u64,
        gateway_connected: bool,
        assistant_connected: bool,
    ) -> Result<(), BridgeError> {
        if !self.is_current(epoch) || self.state != BridgeState::Connecting {
            return Err(BridgeError::Aborted);
        }

        self.gateway_connected = gateway_connected;
        self.assistant_connected = assistant_connected;

        if gateway_connected && assistant_connected {
            self.state = BridgeState::Connected;
            self.connected_since = Some(Utc::now());
            self.last_error = None;
            self.publish();
            return Ok(());
        }

        let message = format!(
            "leaves not connected after start (gateway: {}, assistant: {})",
            gateway_connected, assistant_connected
        );
        self.state = BridgeState::Error;
        self.last_error = Some(message.clone());
        self.publish();
        Err(BridgeError::NotConnected(message))
    }

    fn start_failed(&mut self, epoch: u64, error: String) {
        if epoch != self.epoch {
            return;
        }
        if let Some(token) = &self.run {
            token.cancel();
        }
        self.state = BridgeState::Error;
        self.gateway_connected = false;
        self.assistant_connected = false;
        self.connected_since = None;
        self.last_error = Some(error.clone());
        self.publish();
        self.events.emit(&BridgeEvent::Error { message: error });
    }

    fn stop(&mut self) {
        self.epoch += 1;
        if let Some(token) = self.run.take() {
            token.cancel();
        }
        self.reset_run_state();
        self.queue.clear();
        self.seen_inbound.clear();
        self.seen_outbound.clear();
        self.state = BridgeState::Idle;
        self.publish();
    }

    fn reset_run_state(&mut self) {
        self.last_error = None;
        self.connected_since = None;
        self.gateway_connected = false;
        self.assistant_connected = false;
        self.sessions.clear();
        self.pending_sessions.clear();
    }

    fn leaf_lost(&mut self, leaf: Leaf, reason: &str) {
        match leaf {
            Leaf::Gateway => self.gateway_connected = false,
            Leaf::Assistant => self.assistant_connected = false,
        }

        if self.state == BridgeState::Connected {
            let message = format!("{} disconnected: {}", leaf.name(), reason);
            warn!(leaf = leaf.name(), reason, "Bridge lost a connection");
            self.state = BridgeState::Error;
            self.connected_since = None;
            self.last_error = Some(message.clone());
            self.publish();
            self.events.emit(&BridgeEvent::Error { message });
        } else {
            debug!(leaf = leaf.name(), reason, state = %self.state, "Leaf disconnected");
            self.publish();
        }
    }

    // ------------------------------------------------------------------------
    // Leaf events
    // ------------------------------------------------------------------------

    fn on_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::MessageReceived(data) => self.on_inbound(data),
            GatewayEvent::Connected => {
                self.gateway_connected = true;
                self.publish();
            }
            GatewayEvent::Disconnected { reason } => self.leaf_lost(
                Leaf::Gateway,
                reason.as_deref().unwrap_or("connection closed"),
            ),
            GatewayEvent::Error {
                code,
                message,
                fatal: true,
            } => self.leaf_lost(Leaf::Gateway, &format!("{}: {}", code, message)),
            GatewayEvent::Error { code, message, .. } => {
                warn!(code = %code, message = %message, "Gateway reported an error");
                self.events.emit(&BridgeEvent::Error {
                    message: format!("gateway error ({}): {}", code, message),
                });
            }
            GatewayEvent::Ready { .. }
            | GatewayEvent::CommandOk { .. }
            | GatewayEvent::CommandFailed { .. } => {}
        }
    }

    fn on_assistant_event(&mut self, event: AssistantEvent) {
        match event {
            AssistantEvent::Message(message) => self.on_outbound(message),
            AssistantEvent::Connected => {
                self.assistant_connected = true;
                self.publish();
            }
            AssistantEvent::Disconnected(error) => {
                self.leaf_lost(Leaf::Assistant, &error.to_string())
            }
            AssistantEvent::Error(message) => {
                warn!(message = %message, "Assistant reported an error");
                self.events.emit(&BridgeEvent::Error {
                    message: format!("assistant error: {}", message),
                });
            }
            AssistantEvent::Other { name, .. } => trace!(event = %name, "Ignoring assistant event"),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound: chat → assistant
    // ------------------------------------------------------------------------

    fn on_inbound(&mut self, data: MessageReceivedData) {
        if !self.seen_inbound.insert(&data.message_id) {
            debug!(message_id = %data.message_id, "Dropping duplicate inbound message");
            return;
        }
        if data.text.trim().is_empty() {
            debug!(message_id = %data.message_id, "Dropping empty inbound message");
            return;
        }

        debug!(
            chat_id = %data.chat_id,
            message_id = %data.message_id,
            user_id = %data.user_id,
            "Inbound message"
        );
        self.events.emit(&BridgeEvent::Message {
            direction: Direction::ToAssistant,
            chat_id: Some(data.chat_id.clone()),
            text: data.text.clone(),
        });
        self.route_to_assistant(PendingMessage::to_assistant(data.chat_id, data.text));
    }

    fn route_to_assistant(&mut self, message: PendingMessage) {
        let Some(chat_id) = message.target.clone() else {
            warn!("Dropping inbound message without a chat id");
            return;
        };

        if let Some(session_id) = self.sessions.session_for(&chat_id) {
            let session_id = session_id.to_string();
            self.spawn_send_to_assistant(session_id, message);
            return;
        }

        // At most one creation per chat: later messages wait for it
        if let Some(waiting) = self.pending_sessions.get_mut(&chat_id) {
            waiting.push(message);
            return;
        }
        self.pending_sessions.insert(chat_id.clone(), vec![message]);
        self.spawn_create_session(chat_id);
    }

    fn on_session_created(&mut self, chat_id: String, result: Result<String, AssistantError>) {
        let waiting = self.pending_sessions.remove(&chat_id).unwrap_or_default();
        match result {
            Ok(session_id) => {
                let session_id = self.sessions.insert(&chat_id, &session_id).to_string();
                info!(chat_id = %chat_id, session_id = %session_id, "Session created for chat");
                self.publish();
                for message in waiting {
                    self.spawn_send_to_assistant(session_id.clone(), message);
                }
            }
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Failed to create session");
                let error = e.to_string();
                for message in waiting {
                    self.retry_or_drop(message, &error);
                }
            }
        }
    }

    fn spawn_create_session(&self, chat_id: String) {
        let Some(token) = self.run.clone() else {
            return;
        };
        let assistant = self.assistant.clone();
        let commands = self.commands.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = assistant.create_session() => result,
            };
            post(
                &commands,
                Command::SessionCreated {
                    epoch,
                    chat_id,
                    result,
                },
            );
        });
    }

    fn spawn_send_to_assistant(&self, session_id: String, message: PendingMessage) {
        let Some(token) = self.run.clone() else {
            return;
        };
        let assistant = self.assistant.clone();
        let commands = self.commands.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = assistant.send_message(&session_id, &message.text) => result,
            };
            if let Err(e) = result {
                post(
                    &commands,
                    Command::DeliveryFailed {
                        epoch,
                        message,
                        error: e.to_string(),
                    },
                );
            }
        });
    }

    // ------------------------------------------------------------------------
    // Outbound: assistant → chat
    // ------------------------------------------------------------------------

    fn on_outbound(&mut self, message: AssistantMessage) {
        let text = message.text();
        if text.trim().is_empty() {
            trace!("Dropping assistant message without text");
            return;
        }

        if !self.seen_outbound.insert(&fingerprint(&text)) {
            debug!(session_id = ?message.session_id, "Dropping duplicate assistant reply");
            return;
        }

        let target = self.resolve_chat(message.session_id.as_deref());

        self.events.emit(&BridgeEvent::Message {
            direction: Direction::ToChat,
            chat_id: target.clone(),
            text: text.clone(),
        });

        match target {
            Some(chat_id) => {
                let message = PendingMessage::to_chat(Some(chat_id.clone()), text);
                self.spawn_send_to_chat(chat_id, message);
            }
            None => {
                info!(session_id = ?message.session_id, "No chat for assistant reply yet, queueing");
                self.enqueue(PendingMessage::to_chat(None, text));
            }
        }
    }

    /// Chat owning `session_id`, else the most recently mapped chat.
    fn resolve_chat(&self, session_id: Option<&str>) -> Option<String> {
        session_id
            .and_then(|id| self.sessions.chat_for_session(id))
            .or_else(|| self.sessions.most_recent_chat())
            .map(str::to_string)
    }

    fn spawn_send_to_chat(&self, chat_id: String, message: PendingMessage) {
        let Some(token) = self.run.clone() else {
            return;
        };
        let gateway = self.gateway.clone();
        let commands = self.commands.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = gateway.send_message(&chat_id, &message.text) => result,
            };
            if let Err(e) = result {
                post(
                    &commands,
                    Command::DeliveryFailed {
                        epoch,
                        message,
                        error: e.to_string(),
                    },
                );
            }
        });
    }

    // ------------------------------------------------------------------------
    // Retry queue
    // ------------------------------------------------------------------------

    fn retry_or_drop(&mut self, message: PendingMessage, error: &str) {
        if message.retries >= self.routing.max_retries {
            warn!(
                direction = ?message.direction,
                target = ?message.target,
                retries = message.retries,
                error,
                "Dropping message after exhausting retries"
            );
            return;
        }
        debug!(
            direction = ?message.direction,
            target = ?message.target,
            retries = message.retries,
            error,
            "Delivery failed, queueing for retry"
        );
        self.enqueue(message);
    }

    fn enqueue(&mut self, message: PendingMessage) {
        if let Some(evicted) = self.queue.push(message) {
            warn!(
                direction = ?evicted.direction,
                target = ?evicted.target,
                capacity = self.queue.capacity(),
                "Retry queue full, dropped oldest message"
            );
        }
        self.publish();
    }

    fn drain_retries(&mut self) {
        if self.state != BridgeState::Connected || self.queue.is_empty() {
            return;
        }

        let entries = self.queue.drain_all();
        debug!(count = entries.len(), "Draining retry queue");
        self.publish();

        for mut message in entries {
            message.retries += 1;
            match message.direction {
                Direction::ToAssistant => self.route_to_assistant(message),
                Direction::ToChat => {
                    let target = message
                        .target
                        .clone()
                        .or_else(|| self.resolve_chat(None));
                    match target {
                        Some(chat_id) => {
                            message.target = Some(chat_id.clone());
                            self.spawn_send_to_chat(chat_id, message);
                        }
                        None => self.retry_or_drop(message, "no chat to deliver to"),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    fn snapshot(&self) -> BridgeStatus {
        BridgeStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            gateway_connected: self.gateway_connected,
            assistant_connected: self.assistant_connected,
            retry_queue_depth: self.queue.len(),
            active_sessions: self.sessions.len(),
            connected_since: self.connected_since,
        }
    }

    /// Publish the current status; subscribers hear about it only if it changed.
    fn publish(&self) {
        let status = self.snapshot();
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            trace!(
                state = %status.state,
                queue_depth = status.retry_queue_depth,
                sessions = status.active_sessions,
                "Bridge status changed"
            );
            self.events.emit(&BridgeEvent::StatusChange(status));
        }
    }
}

// ============================================================================
// Forwarding tasks
// ============================================================================

/// Pump a leaf's broadcast channel into the dispatcher until the run ends.
fn forward<E, F>(
    mut events: broadcast::Receiver<E>,
    token: CancellationToken,
    commands: CommandSender,
    leaf: &'static str,
    wrap: F,
) where
    E: Clone + Send + 'static,
    F: Fn(E) -> Command + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    if !post(&commands, wrap(event)) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(leaf, skipped, "Event forwarder lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        trace!(leaf, "Event forwarder stopped");
    });
}

fn spawn_drain_ticker(
    epoch: u64,
    period: std::time::Duration,
    token: CancellationToken,
    commands: CommandSender,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !post(&commands, Command::DrainRetries { epoch }) {
                        break;
                    }
                }
            }
        }
    });
}
