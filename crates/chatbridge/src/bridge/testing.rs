//! In-memory leaves for engine tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::assistant::{AssistantClient, AssistantError, AssistantEvent};
use crate::config::AssistantConfig;
use crate::gateway::{
    ChatGateway, GatewayCredentials, GatewayError, GatewayEvent, MessageReceivedData,
};

// ============================================================================
// FakeGateway
// ============================================================================

pub(crate) struct FakeGateway {
    events: broadcast::Sender<GatewayEvent>,
    connected: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeGateway {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            connected: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    /// Simulate a chat message arriving from the platform.
    pub(crate) fn receive(&self, chat_id: &str, message_id: &str, text: &str) {
        self.emit(GatewayEvent::MessageReceived(MessageReceivedData {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            user_id: "u1".to_string(),
            text: text.to_string(),
            is_mentioned: true,
            timestamp: Utc::now(),
        }));
    }

    /// Every send attempt, including failed ones, as `(chat_id, text)`.
    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatGateway for FakeGateway {
    async fn start(&self, _credentials: &GatewayCredentials) -> Result<(), GatewayError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), GatewayError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), GatewayError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(GatewayError::SendFailed {
                code: "send_failed".to_string(),
                message: "platform unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// FakeAssistant
// ============================================================================

pub(crate) struct FakeAssistant {
    events: broadcast::Sender<AssistantEvent>,
    connected: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    sessions_created: AtomicUsize,
    fail_sessions: AtomicBool,
    fail_sends: AtomicBool,
    start_error: Mutex<Option<AssistantError>>,
    start_delay: Mutex<Duration>,
    session_delay: Mutex<Duration>,
    sent: Mutex<Vec<(String, String)>>,
    hold_port: AtomicBool,
    listener: Mutex<Option<std::net::TcpListener>>,
}

impl FakeAssistant {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            connected: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            sessions_created: AtomicUsize::new(0),
            fail_sessions: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            start_error: Mutex::new(None),
            start_delay: Mutex::new(Duration::ZERO),
            session_delay: Mutex::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
            hold_port: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    pub(crate) fn emit(&self, event: AssistantEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn fail_start(&self, error: AssistantError) {
        *self.start_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn clear_start_failure(&self) {
        self.start_error.lock().unwrap().take();
    }

    pub(crate) fn delay_start(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub(crate) fn delay_sessions(&self, delay: Duration) {
        *self.session_delay.lock().unwrap() = delay;
    }

    pub(crate) fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Listen on the configured port between `start` and `stop`.
    pub(crate) fn hold_port(&self, hold: bool) {
        self.hold_port.store(hold, Ordering::SeqCst);
    }

    /// Every send attempt, including failed ones, as `(session_id, text)`.
    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssistantClient for FakeAssistant {
    async fn start(&self, config: &AssistantConfig) -> Result<(), AssistantError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_port.load(Ordering::SeqCst) {
            let listener = std::net::TcpListener::bind((config.host.as_str(), config.port))
                .map_err(|e| AssistantError::SpawnFailed(e.to_string()))?;
            *self.listener.lock().unwrap() = Some(listener);
        }
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let error = self.start_error.lock().unwrap().clone();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<(), AssistantError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.listener.lock().unwrap().take();
        Ok(())
    }

    async fn create_session(&self) -> Result<String, AssistantError> {
        let delay = *self.session_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(AssistantError::SessionCreateFailed(
                "status 500: internal error".to_string(),
            ));
        }
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("ses_{}", n))
    }

    async fn send_message(&self, session_id: &str, text: &str) -> Result<(), AssistantError> {
        self.sent
            .lock()
            .unwrap()
            .push((session_id.to_string(), text.to_string()));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AssistantError::SendFailed("status 502".to_string()));
        }
        Ok(())
    }

    async fn open_event_stream(&self) -> Result<(), AssistantError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<AssistantEvent> {
        self.events.subscribe()
    }
}
