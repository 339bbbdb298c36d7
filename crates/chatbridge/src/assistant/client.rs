//! HTTP + event-stream client for a supervised assistant process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::AssistantError;
use super::payload::AssistantMessage;
use super::process::ProcessHandle;
use super::{AssistantClient, AssistantEvent};
use crate::config::AssistantConfig;
use crate::sse_parser::SseEventStream;

/// Delay between health probes while waiting for startup.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Per-probe timeout for `GET /health`.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout for `POST /session`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for `POST /session/{id}/message`; the assistant may answer only
/// once the whole turn has been generated.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(300);
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Liveness
// ============================================================================

/// Liveness flags for one run of the process.
///
/// A fresh instance is created on every `start`, so a loss is reported at
/// most once per successful start.
struct Liveness {
    events: broadcast::Sender<AssistantEvent>,
    healthy: AtomicBool,
    stream_open: AtomicBool,
    /// Set once startup succeeded; losses before that fail `start` instead.
    armed: AtomicBool,
    lost: AtomicBool,
}

impl Liveness {
    fn new(events: broadcast::Sender<AssistantEvent>) -> Self {
        Self {
            events,
            healthy: AtomicBool::new(false),
            stream_open: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        }
    }

    fn is_connected(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
            && self.stream_open.load(Ordering::SeqCst)
            && !self.lost.load(Ordering::SeqCst)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn report_lost(&self, error: AssistantError) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.armed.load(Ordering::SeqCst) {
            warn!(error = %error, "Assistant liveness lost");
            let _ = self.events.send(AssistantEvent::Disconnected(error));
        }
    }

    /// Silence further reports; used on deliberate stop.
    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.healthy.store(false, Ordering::SeqCst);
        self.stream_open.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Running state
// ============================================================================

struct Running {
    process: ProcessHandle,
    base_url: String,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    async fn shutdown(self) {
        self.cancel.cancel();
        self.liveness.disarm();
        for task in self.tasks {
            let _ = task.await;
        }
        self.process.stop().await;
    }
}

// ============================================================================
// AssistantProcessClient
// ============================================================================

/// Client owning one assistant subprocess.
pub struct AssistantProcessClient {
    http: Client,
    events: broadcast::Sender<AssistantEvent>,
    running: Mutex<Option<Running>>,
}

impl Default for AssistantProcessClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AssistantProcessClient {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(http: Client) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            http,
            events,
            running: Mutex::new(None),
        }
    }

    /// PID of the running assistant, if any.
    pub fn pid(&self) -> Option<u32> {
        self.lock_running().as_ref().and_then(|r| r.process.pid())
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn base_url(&self) -> Result<String, AssistantError> {
        self.lock_running()
            .as_ref()
            .map(|r| r.base_url.clone())
            .ok_or(AssistantError::NotRunning)
    }

    /// Remove the current run if it is still the one tracked by `liveness`.
    fn take_run_if(&self, liveness: &Arc<Liveness>) -> Option<Running> {
        let mut guard = self.lock_running();
        if guard
            .as_ref()
            .is_some_and(|r| Arc::ptr_eq(&r.liveness, liveness))
        {
            guard.take()
        } else {
            None
        }
    }

    /// Attach a background task to the run tracked by `liveness`.
    ///
    /// Returns false (and aborts the task) if that run was stopped meanwhile.
    fn attach_task(&self, liveness: &Arc<Liveness>, task: JoinHandle<()>) -> bool {
        let mut guard = self.lock_running();
        match guard.as_mut() {
            Some(run) if Arc::ptr_eq(&run.liveness, liveness) => {
                run.tasks.push(task);
                true
            }
            _ => {
                task.abort();
                false
            }
        }
    }

    async fn wait_for_ready(
        &self,
        base_url: &str,
        timeout: Duration,
        liveness: &Liveness,
        cancel: &CancellationToken,
    ) -> Result<(), AssistantError> {
        let start = Instant::now();
        debug!(base_url, "Waiting for assistant to become healthy");

        loop {
            if liveness.is_lost() {
                return Err(AssistantError::ProcessCrashed(
                    "assistant exited during startup".to_string(),
                ));
            }

            let health = tokio::select! {
                _ = cancel.cancelled() => return Err(AssistantError::Aborted),
                health = check_health(&self.http, base_url) => health,
            };
            match health {
                Ok(()) => {
                    info!(elapsed = ?start.elapsed(), "Assistant is healthy");
                    return Ok(());
                }
                Err(reason) => trace!(reason, "Assistant not ready yet"),
            }

            if start.elapsed() >= timeout {
                warn!(timeout = ?timeout, "Assistant did not become healthy in time");
                return Err(AssistantError::StartupTimeout(timeout));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(AssistantError::Aborted),
                _ = tokio::time::sleep(STARTUP_POLL_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl AssistantClient for AssistantProcessClient {
    async fn start(&self, config: &AssistantConfig) -> Result<(), AssistantError> {
        // Restart semantics: never leave an earlier process behind
        self.stop().await?;

        let liveness = Arc::new(Liveness::new(self.events.clone()));
        let on_exit = {
            let liveness = liveness.clone();
            move |code: Option<i32>| {
                let reason = match code {
                    Some(code) => format!("exited with status {}", code),
                    None => "terminated by signal".to_string(),
                };
                liveness.report_lost(AssistantError::ProcessCrashed(reason));
            }
        };

        let process = ProcessHandle::spawn(config, config.stop_grace(), on_exit)?;
        let base_url = config.base_url();
        let cancel = CancellationToken::new();

        let previous = self.lock_running().replace(Running {
            process,
            base_url: base_url.clone(),
            liveness: liveness.clone(),
            cancel: cancel.clone(),
            tasks: Vec::new(),
        });
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        if let Err(e) = self
            .wait_for_ready(&base_url, config.startup_timeout(), &liveness, &cancel)
            .await
        {
            if let Some(run) = self.take_run_if(&liveness) {
                run.shutdown().await;
            }
            return Err(e);
        }

        liveness.healthy.store(true, Ordering::SeqCst);
        liveness.armed.store(true, Ordering::SeqCst);

        let poller = tokio::spawn(health_loop(
            self.http.clone(),
            base_url,
            config.health_interval(),
            liveness.clone(),
            cancel,
        ));
        if !self.attach_task(&liveness, poller) {
            return Err(AssistantError::Aborted);
        }

        Ok(())
    }

    async fn stop(&self) -> Result<(), AssistantError> {
        let Some(run) = self.lock_running().take() else {
            return Ok(());
        };
        let pid = run.process.pid();
        let addr = format!("{}:{}", run.process.host(), run.process.port());
        let work_dir = run.process.work_dir().display().to_string();
        let already_exited = !run.process.is_alive();
        run.shutdown().await;
        info!(
            pid = ?pid,
            addr = %addr,
            work_dir = %work_dir,
            already_exited,
            "Assistant stopped"
        );
        Ok(())
    }

    async fn create_session(&self) -> Result<String, AssistantError> {
        let base_url = self.base_url()?;

        let response = self
            .http
            .post(format!("{}/session", base_url))
            .json(&json!({}))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| AssistantError::SessionCreateFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AssistantError::SessionCreateFailed(format!(
                "status {}: {}",
                status, message
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AssistantError::SessionCreateFailed(format!("invalid response: {}", e)))?;

        let id = body
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AssistantError::SessionCreateFailed("response missing session id".to_string())
            })?;

        debug!(session_id = %id, "Assistant session created");
        Ok(id.to_string())
    }

    async fn send_message(&self, session_id: &str, text: &str) -> Result<(), AssistantError> {
        let base_url = self.base_url()?;
        let body = json!({ "parts": [{ "type": "text", "text": text }] });

        let response = self
            .http
            .post(format!("{}/session/{}/message", base_url, session_id))
            .json(&body)
            .timeout(MESSAGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| AssistantError::SendFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AssistantError::SendFailed(format!(
                "status {}: {}",
                status, message
            )));
        }

        // The response may carry the reply inline; the same turn can also
        // arrive on the event stream, and the bridge deduplicates.
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AssistantError::SendFailed(e.to_string()))?;
        if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
            let mut reply = AssistantMessage::from_value(&value);
            if !reply.text().is_empty() {
                reply.session_id.get_or_insert_with(|| session_id.to_string());
                let _ = self.events.send(AssistantEvent::Message(reply));
            }
        }

        Ok(())
    }

    async fn open_event_stream(&self) -> Result<(), AssistantError> {
        let (base_url, liveness, cancel) = {
            let guard = self.lock_running();
            let run = guard.as_ref().ok_or(AssistantError::NotRunning)?;
            if run.liveness.stream_open.load(Ordering::SeqCst) {
                return Ok(());
            }
            (
                run.base_url.clone(),
                run.liveness.clone(),
                run.cancel.clone(),
            )
        };

        let response = self
            .http
            .get(format!("{}/event", base_url))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| AssistantError::StreamDisconnected(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AssistantError::StreamDisconnected(format!(
                "event endpoint returned status {}",
                response.status().as_u16()
            )));
        }

        liveness.stream_open.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_events(
            response,
            self.events.clone(),
            liveness.clone(),
            cancel,
        ));
        if !self.attach_task(&liveness, reader) {
            return Err(AssistantError::Aborted);
        }

        info!("Assistant event stream opened");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|r| r.liveness.is_connected())
    }

    fn subscribe(&self) -> broadcast::Receiver<AssistantEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Background tasks
// ============================================================================

async fn check_health(http: &Client, base_url: &str) -> Result<(), String> {
    let response = http
        .get(format!("{}/health", base_url))
        .timeout(HEALTH_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("health returned status {}", response.status().as_u16()));
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Bool(false)) => Err("health reported unhealthy".to_string()),
        Ok(Value::Object(map)) if map.get("healthy") == Some(&Value::Bool(false)) => {
            Err("health reported unhealthy".to_string())
        }
        _ => Ok(()),
    }
}

async fn health_loop(
    http: Client,
    base_url: String,
    period: Duration,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = check_health(&http, &base_url) => result,
        };
        if let Err(reason) = result {
            liveness.healthy.store(false, Ordering::SeqCst);
            liveness.report_lost(AssistantError::ProcessCrashed(format!(
                "health check failed: {}",
                reason
            )));
            break;
        }
    }
    debug!("Assistant health poller stopped");
}

async fn read_events(
    response: reqwest::Response,
    events: broadcast::Sender<AssistantEvent>,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
) {
    let mut frames = SseEventStream::new(Box::pin(response.bytes_stream()));

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => match AssistantEvent::from_frame(&frame) {
                AssistantEvent::Disconnected(error) => liveness.report_lost(error),
                event => {
                    if let AssistantEvent::Other { name, .. } = &event {
                        debug!(event = %name, "Unrecognised assistant event");
                    }
                    let _ = events.send(event);
                }
            },
            Some(Err(e)) => {
                liveness.stream_open.store(false, Ordering::SeqCst);
                liveness.report_lost(AssistantError::StreamDisconnected(e.to_string()));
                break;
            }
            None => {
                liveness.stream_open.store(false, Ordering::SeqCst);
                liveness.report_lost(AssistantError::StreamDisconnected(
                    "event stream closed".to_string(),
                ));
                break;
            }
        }
    }

    liveness.stream_open.store(false, Ordering::SeqCst);
    debug!("Assistant event stream reader stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    use axum::Router;
    use axum::body::Body;
    use axum::extract::{Path, State};
    use axum::http::{StatusCode, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, oneshot};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::bridge::testing::FakeGateway;
    use crate::bridge::{BridgeEngine, BridgeState};
    use crate::config::BridgeConfig;

    type FrameSender = mpsc::UnboundedSender<Result<Bytes, Infallible>>;

    #[derive(Default)]
    struct MockAssistant {
        healthy: AtomicBool,
        sessions_created: AtomicUsize,
        messages: Mutex<Vec<(String, Value)>>,
        inline_reply: Mutex<Option<Value>>,
        stream: Mutex<Option<FrameSender>>,
    }

    impl MockAssistant {
        fn push(&self, chunk: &'static str) {
            let guard = self.stream.lock().unwrap();
            guard
                .as_ref()
                .expect("event stream not open")
                .send(Ok(Bytes::from_static(chunk.as_bytes())))
                .unwrap();
        }

        fn close_stream(&self) {
            self.stream.lock().unwrap().take();
        }
    }

    async fn health(State(mock): State<Arc<MockAssistant>>) -> Response {
        if mock.healthy.load(Ordering::SeqCst) {
            (StatusCode::OK, "{\"healthy\":true}").into_response()
        } else {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }

    async fn create_session(State(mock): State<Arc<MockAssistant>>) -> Response {
        let n = mock.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        axum::Json(json!({ "id": format!("ses_{}", n) })).into_response()
    }

    async fn post_message(
        State(mock): State<Arc<MockAssistant>>,
        Path(session_id): Path<String>,
        axum::Json(body): axum::Json<Value>,
    ) -> Response {
        mock.messages.lock().unwrap().push((session_id, body));
        match mock.inline_reply.lock().unwrap().clone() {
            Some(reply) => axum::Json(reply).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        }
    }

    async fn events(State(mock): State<Arc<MockAssistant>>) -> Response {
        let (tx, rx) = mpsc::unbounded_channel();
        *mock.stream.lock().unwrap() = Some(tx);
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(UnboundedReceiverStream::new(rx)),
        )
            .into_response()
    }

    fn mock_app() -> (Arc<MockAssistant>, Router) {
        let mock = Arc::new(MockAssistant::default());
        mock.healthy.store(true, Ordering::SeqCst);

        let app = Router::new()
            .route("/health", get(health))
            .route("/session", post(create_session))
            .route("/session/{id}/message", post(post_message))
            .route("/event", get(events))
            .with_state(mock.clone());
        (mock, app)
    }

    async fn spawn_mock() -> (Arc<MockAssistant>, u16) {
        let (mock, app) = mock_app();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (mock, port)
    }

    /// Mock whose port is reserved but refuses connections until `listen`
    /// fires, so a free-port check before launch still passes.
    fn spawn_mock_deferred() -> (Arc<MockAssistant>, u16, oneshot::Sender<()>) {
        let (mock, app) = mock_app();
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = socket.local_addr().unwrap().port();
        let (listen, listen_rx) = oneshot::channel();
        tokio::spawn(async move {
            if listen_rx.await.is_err() {
                return;
            }
            let listener = socket.listen(64).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
        (mock, port, listen)
    }

    /// Config whose "assistant" is a sleeping shell; HTTP is served by the mock.
    fn config(dir: &TempDir, port: u16, script: &str) -> AssistantConfig {
        AssistantConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            work_dir: Some(dir.path().to_path_buf()),
            host: "127.0.0.1".to_string(),
            port,
            startup_timeout_seconds: 5,
            health_interval_seconds: 1,
            stop_grace_seconds: 2,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<AssistantEvent>) -> AssistantEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn started_client(dir: &TempDir, port: u16) -> AssistantProcessClient {
        let client = AssistantProcessClient::new();
        client.start(&config(dir, port, "sleep 30")).await.unwrap();
        client.open_event_stream().await.unwrap();
        client
    }

    #[tokio::test]
    async fn start_open_and_stop() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        let client = AssistantProcessClient::new();

        client.start(&config(&dir, port, "sleep 30")).await.unwrap();
        assert!(client.pid().is_some());
        assert!(!client.is_connected(), "stream not open yet");

        client.open_event_stream().await.unwrap();
        assert!(client.is_connected());

        let session = client.create_session().await.unwrap();
        assert_eq!(session, "ses_1");
        client.send_message(&session, "hello").await.unwrap();

        let messages = mock.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "ses_1");
        assert_eq!(messages[0].1["parts"][0]["type"], "text");
        assert_eq!(messages[0].1["parts"][0]["text"], "hello");

        client.stop().await.unwrap();
        assert!(!client.is_connected());
        assert!(client.pid().is_none());
        // Idempotent
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn startup_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        mock.healthy.store(false, Ordering::SeqCst);

        let client = AssistantProcessClient::new();
        let mut cfg = config(&dir, port, "sleep 30");
        cfg.startup_timeout_seconds = 1;

        let err = client.start(&cfg).await.unwrap_err();
        assert_eq!(err, AssistantError::StartupTimeout(Duration::from_secs(1)));
        assert!(client.pid().is_none());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn early_exit_fails_startup() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        mock.healthy.store(false, Ordering::SeqCst);

        let client = AssistantProcessClient::new();
        let err = client.start(&config(&dir, port, "exit 1")).await.unwrap_err();
        assert!(matches!(err, AssistantError::ProcessCrashed(_)));
    }

    #[tokio::test]
    async fn calls_while_stopped_fail() {
        let client = AssistantProcessClient::new();
        assert_eq!(
            client.create_session().await.unwrap_err(),
            AssistantError::NotRunning
        );
        assert_eq!(
            client.send_message("ses_1", "hi").await.unwrap_err(),
            AssistantError::NotRunning
        );
        assert_eq!(
            client.open_event_stream().await.unwrap_err(),
            AssistantError::NotRunning
        );
    }

    #[tokio::test]
    async fn split_frames_are_reassembled() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        let client = started_client(&dir, port).await;
        let mut rx = client.subscribe();

        mock.push("event: mess");
        mock.push("age\ndata: {\"sessionID\":\"ses_1\",\"parts\":[{\"type\":\"te");
        mock.push("xt\",\"text\":\"Hi\"}]}\n\n");

        let AssistantEvent::Message(msg) = next_event(&mut rx).await else {
            panic!("expected message event");
        };
        assert_eq!(msg.session_id.as_deref(), Some("ses_1"));
        assert_eq!(msg.text(), "Hi");

        mock.push("event: session.idle\ndata: {}\n\n");
        assert!(matches!(
            next_event(&mut rx).await,
            AssistantEvent::Other { name, .. } if name == "session.idle"
        ));

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_frame_is_reported_once() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        let client = started_client(&dir, port).await;
        let mut rx = client.subscribe();

        mock.push("event: disconnected\ndata: {}\n\n");
        mock.push("event: disconnected\ndata: {}\n\n");
        mock.push("event: connected\ndata: {}\n\n");

        assert!(matches!(
            next_event(&mut rx).await,
            AssistantEvent::Disconnected(AssistantError::StreamDisconnected(_))
        ));
        assert_eq!(next_event(&mut rx).await, AssistantEvent::Connected);
        assert!(!client.is_connected());

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stream_eof_raises_disconnected() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        let client = started_client(&dir, port).await;
        let mut rx = client.subscribe();

        mock.close_stream();

        assert!(matches!(
            next_event(&mut rx).await,
            AssistantEvent::Disconnected(AssistantError::StreamDisconnected(_))
        ));
        assert!(!client.is_connected());
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failing_health_check_raises_disconnected() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        let client = started_client(&dir, port).await;
        let mut rx = client.subscribe();

        mock.healthy.store(false, Ordering::SeqCst);

        assert!(matches!(
            next_event(&mut rx).await,
            AssistantEvent::Disconnected(AssistantError::ProcessCrashed(_))
        ));
        assert!(!client.is_connected());
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_raises_disconnected() {
        let dir = TempDir::new().unwrap();
        let (_mock, port) = spawn_mock().await;
        let client = AssistantProcessClient::new();
        let mut rx = client.subscribe();

        client.start(&config(&dir, port, "sleep 1")).await.unwrap();

        assert!(matches!(
            next_event(&mut rx).await,
            AssistantEvent::Disconnected(AssistantError::ProcessCrashed(_))
        ));
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn inline_reply_is_surfaced_as_message() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        *mock.inline_reply.lock().unwrap() = Some(json!({
            "info": {"id": "msg_1", "role": "assistant"},
            "parts": [{"type": "text", "text": "pong"}]
        }));
        let client = started_client(&dir, port).await;
        let mut rx = client.subscribe();

        client.send_message("ses_7", "ping").await.unwrap();

        let AssistantEvent::Message(msg) = next_event(&mut rx).await else {
            panic!("expected message event");
        };
        assert_eq!(msg.session_id.as_deref(), Some("ses_7"));
        assert_eq!(msg.text(), "pong");
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_aborts_pending_start() {
        let dir = TempDir::new().unwrap();
        let (mock, port) = spawn_mock().await;
        mock.healthy.store(false, Ordering::SeqCst);

        let client = Arc::new(AssistantProcessClient::new());
        let starter = {
            let client = client.clone();
            let cfg = config(&dir, port, "sleep 30");
            tokio::spawn(async move { client.start(&cfg).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        client.stop().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(3), starter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), AssistantError::Aborted);
        assert!(client.pid().is_none());
    }

    #[tokio::test]
    async fn disconnected_frame_moves_bridge_to_error() {
        let dir = TempDir::new().unwrap();
        let (mock, port, listen) = spawn_mock_deferred();
        let gateway = Arc::new(FakeGateway::new());
        let engine = Arc::new(BridgeEngine::new(
            gateway.clone(),
            Arc::new(AssistantProcessClient::new()),
        ));

        let mut cfg = BridgeConfig::default();
        cfg.gateway.app_id = "cli_a1".to_string();
        cfg.gateway.app_secret = "secret".to_string();
        cfg.assistant = config(&dir, port, "sleep 30");

        let starter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start(&cfg).await })
        };
        // The gateway starts after the port check; only then start serving
        tokio::time::timeout(Duration::from_secs(5), async {
            while gateway.start_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        listen.send(()).unwrap();

        starter.await.unwrap().unwrap();
        assert_eq!(engine.status().state, BridgeState::Connected);
        assert!(engine.status().assistant_connected);

        mock.push("event: disconnected\ndata: {}\n\n");

        let mut status = engine.watch_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == BridgeState::Error),
        )
        .await
        .unwrap()
        .unwrap();
        let status = engine.status();
        assert!(!status.assistant_connected);
        assert!(status.gateway_connected);
        assert!(status.last_error.unwrap().starts_with("assistant disconnected"));

        engine.stop().await;
        assert_eq!(engine.status().state, BridgeState::Idle);
    }
}
