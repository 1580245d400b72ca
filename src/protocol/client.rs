//! Client side of the agent client protocol (JSON-RPC 2.0 over a duplex
//! byte stream).
//!
//! A background task owns the read half. It routes responses to waiting
//! callers, turns `session/update` notifications into [`ProtocolEvent`]s for
//! the active prompt, and rejects agent-initiated requests. The task is the
//! only producer into a prompt's bounded event channel, so a slow consumer
//! slows the reader instead of growing a buffer.
//!
//! ```text
//! Unstarted -> Handshaking -> Ready <-> Streaming
//!                   |           |           |
//!                   +-----------+-----------+--> Stopped
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::Stream;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::events::{ProtocolEvent, parse_session_update};
use crate::protocol::frame::{
    Inbound, METHOD_NOT_FOUND, encode_error_response, encode_notification, encode_request,
    parse_frame,
};
use crate::protocol::transport::{AgentTransport, BoxedReader, BoxedWriter};
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::ProtocolTimeouts;

const PROTOCOL_VERSION: u64 = 1;
const MAX_CONSECUTIVE_MALFORMED: u32 = 3;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Handshaking,
    Ready,
    Streaming,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unstarted => "unstarted",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Streaming => "streaming",
            SessionState::Stopped => "stopped",
        }
    }
}

/// Identifies this client in `initialize`.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            title: "Sandbox Orchestrator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

type EventResult = Result<ProtocolEvent, SandboxError>;
type Waiter = oneshot::Sender<Result<Value, SandboxError>>;

struct ActivePrompt {
    request_id: u64,
    tx: mpsc::Sender<EventResult>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Why the reader stopped.
enum StopCause {
    Desync(String),
    Closed(String),
}

impl StopCause {
    fn call_error(&self) -> SandboxError {
        match self {
            StopCause::Desync(m) => SandboxError::ProtocolDesync(m.clone()),
            StopCause::Closed(m) => SandboxError::Backend(m.clone()),
        }
    }

    fn into_terminal(self) -> EventResult {
        match self {
            StopCause::Desync(m) => Err(SandboxError::ProtocolDesync(m)),
            StopCause::Closed(message) => Ok(ProtocolEvent::Error { message, code: None }),
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    session_id: Mutex<Option<String>>,
    pending: Mutex<HashMap<u64, Waiter>>,
    active: Mutex<Option<ActivePrompt>>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    next_id: AtomicU64,
    reader_alive: AtomicBool,
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    async fn write_frame(&self, frame: &str) -> Result<(), SandboxError> {
        tracing::trace!(frame = frame.trim_end(), "client -> agent");
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if let Err(e) = self.write_frame(&encode_request(id, method, params)).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        rx.await
            .map_err(|_| SandboxError::Backend(format!("agent session closed during {method}")))?
    }

    async fn send_cancel(&self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let frame = encode_notification("session/cancel", json!({ "sessionId": session_id }));
        if let Err(e) = self.write_frame(&frame).await {
            tracing::debug!(error = %e, "session/cancel not delivered");
        }
    }

    /// Detach the active prompt if it is `request_id`. Returns whether it was.
    fn abandon(&self, request_id: u64) -> bool {
        let mut active = lock(&self.active);
        if !active.as_ref().is_some_and(|a| a.request_id == request_id) {
            return false;
        }
        *active = None;
        drop(active);
        let mut state = lock(&self.state);
        if *state == SessionState::Streaming {
            *state = SessionState::Ready;
        }
        true
    }

    async fn dispatch(&self, frame: Inbound) {
        match frame {
            Inbound::Response { id, result } => {
                let waiter = lock(&self.pending).remove(&id);
                if let Some(tx) = waiter {
                    let result = result.map_err(|e| SandboxError::Agent {
                        code: e.code,
                        message: e.message,
                    });
                    let _ = tx.send(result);
                    return;
                }

                let prompt = {
                    let mut active = lock(&self.active);
                    if active.as_ref().is_some_and(|a| a.request_id == id) {
                        active.take()
                    } else {
                        None
                    }
                };
                let Some(prompt) = prompt else {
                    tracing::debug!(request_id = id, "dropping response for abandoned request");
                    return;
                };

                // Ready before the terminal item is observable.
                {
                    let mut state = lock(&self.state);
                    if *state == SessionState::Streaming {
                        *state = SessionState::Ready;
                    }
                }
                let event = match result {
                    Ok(v) => ProtocolEvent::PromptResponse {
                        stop_reason: v
                            .get("stopReason")
                            .and_then(Value::as_str)
                            .unwrap_or("end_turn")
                            .to_string(),
                    },
                    Err(e) => ProtocolEvent::Error {
                        message: e.message,
                        code: Some(e.code),
                    },
                };
                let _ = prompt.tx.send(Ok(event)).await;
            }
            Inbound::Notification { method, params } if method == "session/update" => {
                let Some((session_id, event)) = parse_session_update(&params) else {
                    return;
                };
                if session_id.is_some() && session_id != self.session_id() {
                    tracing::debug!(?session_id, "update for another session");
                    return;
                }
                let tx = lock(&self.active).as_ref().map(|a| a.tx.clone());
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Ok(event)).await;
                    }
                    None => tracing::trace!("update with no active prompt"),
                }
            }
            Inbound::Notification { method, .. } => {
                tracing::trace!(method = %method, "ignoring notification");
            }
            Inbound::Request { id, method } => {
                tracing::debug!(method = %method, "rejecting agent request");
                let frame = encode_error_response(
                    &id,
                    METHOD_NOT_FOUND,
                    &format!("Method not supported: {method}"),
                );
                if let Err(e) = self.write_frame(&frame).await {
                    tracing::warn!(error = %e, "failed to answer agent request");
                }
            }
        }
    }

    /// Move to `Stopped` and deliver a final outcome to every waiter.
    async fn stop(&self, cause: StopCause) {
        self.set_state(SessionState::Stopped);
        let waiters: Vec<Waiter> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        let prompt = lock(&self.active).take();
        for tx in waiters {
            let _ = tx.send(Err(cause.call_error()));
        }
        if let Some(prompt) = prompt {
            let _ = prompt.tx.send(cause.into_terminal()).await;
        }
    }

    /// Synchronous variant of `stop` for teardown paths.
    fn stop_now(&self, message: &str) {
        self.set_state(SessionState::Stopped);
        let waiters: Vec<Waiter> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in waiters {
            let _ = tx.send(Err(SandboxError::Backend(message.to_string())));
        }
        if let Some(prompt) = lock(&self.active).take() {
            let _ = prompt.tx.try_send(Ok(ProtocolEvent::Error {
                message: message.to_string(),
                code: None,
            }));
        }
    }
}

fn decode_line(buf: &[u8]) -> Option<Result<Inbound, String>> {
    let line = match std::str::from_utf8(buf) {
        Ok(s) => s.trim(),
        Err(e) => return Some(Err(format!("invalid utf-8: {e}"))),
    };
    if line.is_empty() {
        return None;
    }
    tracing::trace!(frame = line, "agent -> client");
    Some(parse_frame(line).map_err(|e| e.to_string()))
}

async fn read_loop(shared: Arc<Shared>, reader: BoxedReader) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut malformed = 0u32;

    let cause = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break StopCause::Closed("agent process exited".into()),
            Ok(_) => match decode_line(&buf) {
                None => {}
                Some(Ok(frame)) => {
                    malformed = 0;
                    shared.dispatch(frame).await;
                }
                Some(Err(e)) => {
                    malformed += 1;
                    tracing::warn!(error = %e, consecutive = malformed, "skipping malformed frame");
                    if malformed >= MAX_CONSECUTIVE_MALFORMED {
                        break StopCause::Desync(format!(
                            "{malformed} consecutive malformed frames, last: {e}"
                        ));
                    }
                }
            },
            Err(e) => break StopCause::Closed(format!("agent stream failed: {e}")),
        }
    };

    shared.reader_alive.store(false, Ordering::SeqCst);
    match &cause {
        StopCause::Desync(msg) => tracing::error!(reason = %msg, "agent protocol desync"),
        StopCause::Closed(msg) => tracing::info!(reason = %msg, "agent stream closed"),
    }
    shared.stop(cause).await;
}

/// One protocol session with one agent process.
pub struct AgentProtocolClient {
    shared: Arc<Shared>,
    reader: Mutex<Option<BoxedReader>>,
    reader_task: Option<JoinHandle<()>>,
    timeouts: ProtocolTimeouts,
    client_info: ClientInfo,
    agent_info: Option<Value>,
    agent_capabilities: Option<Value>,
}

impl AgentProtocolClient {
    pub fn new(transport: AgentTransport, timeouts: ProtocolTimeouts) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Unstarted),
                session_id: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                active: Mutex::new(None),
                writer: tokio::sync::Mutex::new(transport.writer),
                next_id: AtomicU64::new(0),
                reader_alive: AtomicBool::new(false),
            }),
            reader: Mutex::new(Some(transport.reader)),
            reader_task: None,
            timeouts,
            client_info: ClientInfo::default(),
            agent_info: None,
            agent_capabilities: None,
        }
    }

    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = info;
        self
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    pub fn agent_info(&self) -> Option<&Value> {
        self.agent_info.as_ref()
    }

    pub fn agent_capabilities(&self) -> Option<&Value> {
        self.agent_capabilities.as_ref()
    }

    /// `initialize` then `session/new`, both under one handshake deadline.
    /// Returns the new session id. Any failure leaves the client `Stopped`.
    pub async fn handshake(&mut self, cwd: &str) -> Result<String, SandboxError> {
        let Some(reader) = lock(&self.reader).take() else {
            return Err(SandboxError::SessionNotReady(self.state().as_str()));
        };
        self.shared.set_state(SessionState::Handshaking);
        self.shared.reader_alive.store(true, Ordering::SeqCst);
        self.reader_task = Some(tokio::spawn(read_loop(self.shared.clone(), reader)));

        let limit = self.timeouts.handshake;
        let outcome = tokio::time::timeout(limit, self.run_handshake(cwd)).await;
        match outcome {
            Ok(Ok((init, session_id))) => {
                self.agent_info = init.get("agentInfo").cloned();
                self.agent_capabilities = init.get("agentCapabilities").cloned();
                *lock(&self.shared.session_id) = Some(session_id.clone());
                self.shared.set_state(SessionState::Ready);
                tracing::info!(
                    session_id = %session_id,
                    agent = ?self.agent_info,
                    "agent session ready"
                );
                Ok(session_id)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "agent handshake failed");
                self.stop_reader("handshake failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(timeout = ?limit, "agent handshake timed out");
                self.stop_reader("handshake timed out");
                Err(SandboxError::HandshakeTimeout(limit))
            }
        }
    }

    async fn run_handshake(&self, cwd: &str) -> Result<(Value, String), SandboxError> {
        let init = self
            .shared
            .call(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientCapabilities": {
                        "fs": { "readTextFile": false, "writeTextFile": false },
                        "terminal": false,
                    },
                    "clientInfo": {
                        "name": self.client_info.name,
                        "title": self.client_info.title,
                        "version": self.client_info.version,
                    },
                }),
            )
            .await?;

        let session = self
            .shared
            .call("session/new", json!({ "cwd": cwd, "mcpServers": [] }))
            .await?;
        let session_id = session
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SandboxError::Serde("session/new response has no sessionId".into()))?
            .to_string();
        Ok((init, session_id))
    }

    /// Send a prompt and stream its events. Fails fast with `Busy` while
    /// another prompt is streaming.
    pub async fn send_message(&self, text: &str) -> Result<EventStream, SandboxError> {
        let session_id = {
            let mut state = lock(&self.shared.state);
            match *state {
                SessionState::Ready => {}
                SessionState::Streaming => {
                    return Err(SandboxError::Busy(self.session_id().unwrap_or_default()));
                }
                other => return Err(SandboxError::SessionNotReady(other.as_str())),
            }
            let Some(session_id) = self.shared.session_id() else {
                return Err(SandboxError::SessionNotReady(state.as_str()));
            };
            *state = SessionState::Streaming;
            session_id
        };

        let request_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *lock(&self.shared.active) = Some(ActivePrompt { request_id, tx });

        // Dropping the stream on any early return releases the session.
        let stream = EventStream {
            shared: self.shared.clone(),
            rx,
            request_id,
            deadline: Instant::now() + self.timeouts.end_to_end,
            timeouts: self.timeouts,
            done: false,
        };

        let frame = encode_request(
            request_id,
            "session/prompt",
            json!({
                "sessionId": session_id,
                "prompt": [{ "type": "text", "text": text }],
            }),
        );
        self.shared.write_frame(&frame).await?;
        tracing::debug!(request_id, session_id = %session_id, "prompt sent");
        Ok(stream)
    }

    fn stop_reader(&mut self, message: &str) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.shared.reader_alive.store(false, Ordering::SeqCst);
        self.shared.stop_now(message);
    }

    /// Stop the session and close the write half so the agent sees EOF.
    pub async fn close(&mut self) {
        self.stop_reader("session closed");
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "closing agent stdin failed");
        }
    }
}

impl Drop for AgentProtocolClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Events of one prompt, in arrival order, ending with exactly one terminal
/// item. Dropping it early cancels the prompt.
pub struct EventStream {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<EventResult>,
    request_id: u64,
    deadline: Instant,
    timeouts: ProtocolTimeouts,
    done: bool,
}

impl EventStream {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// State of the session this prompt belongs to.
    pub fn session_state(&self) -> SessionState {
        self.shared.state()
    }

    /// Next item, or `None` once the terminal item has been returned.
    ///
    /// A read deadline that passes while the agent is alive is absorbed. If
    /// the whole exchange outlives the end-to-end deadline the prompt is
    /// cancelled and `ProtocolTimeout` is the terminal item.
    pub async fn next_event(&mut self) -> Option<EventResult> {
        if self.done {
            return None;
        }
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                return Some(self.expire().await);
            }
            let wait = self.timeouts.read.min(self.deadline - now);
            match tokio::time::timeout(wait, self.rx.recv()).await {
                Ok(Some(item)) => {
                    if item.as_ref().map_or(true, ProtocolEvent::is_terminal) {
                        self.done = true;
                    }
                    return Some(item);
                }
                Ok(None) => {
                    self.done = true;
                    return Some(Ok(ProtocolEvent::Error {
                        message: "agent stream closed".into(),
                        code: None,
                    }));
                }
                Err(_) => {
                    if !self.shared.reader_alive.load(Ordering::SeqCst) {
                        self.done = true;
                        return Some(Ok(ProtocolEvent::Error {
                            message: "agent stopped responding".into(),
                            code: None,
                        }));
                    }
                    tracing::debug!(request_id = self.request_id, "no frame within read deadline");
                }
            }
        }
    }

    async fn expire(&mut self) -> EventResult {
        self.done = true;
        tracing::warn!(
            request_id = self.request_id,
            timeout = ?self.timeouts.end_to_end,
            "prompt exceeded end-to-end deadline"
        );
        if self.shared.abandon(self.request_id) {
            self.shared.send_cancel().await;
        }
        Err(SandboxError::ProtocolTimeout(self.timeouts.end_to_end))
    }

    /// Stop consuming and tell the agent to cancel the prompt.
    pub async fn cancel(mut self) {
        if !self.done {
            self.done = true;
            if self.shared.abandon(self.request_id) {
                self.shared.send_cancel().await;
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = EventResult> + Send {
        async_stream::stream! {
            let mut events = self;
            while let Some(item) = events.next_event().await {
                yield item;
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if self.done || !self.shared.abandon(self.request_id) {
            return;
        }
        tracing::debug!(request_id = self.request_id, "event stream dropped, cancelling prompt");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            handle.spawn(async move { shared.send_cancel().await });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// What the fake agent does in reply to one inbound frame.
    pub(crate) enum Act {
        Send(Value),
        Close,
    }

    /// Runs a scripted agent on the far end of a duplex stream.
    pub(crate) fn spawn_agent<F>(stream: DuplexStream, mut script: F) -> JoinHandle<Vec<Value>>
    where
        F: FnMut(&Value) -> Vec<Act> + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let acts = script(&frame);
                seen.push(frame);
                for act in acts {
                    match act {
                        Act::Send(v) => {
                            let mut s = v.to_string();
                            s.push('\n');
                            if write.write_all(s.as_bytes()).await.is_err() {
                                return seen;
                            }
                        }
                        Act::Close => return seen,
                    }
                }
            }
            seen
        })
    }

    pub(crate) fn result(frame: &Value, result: Value) -> Act {
        Act::Send(json!({ "jsonrpc": "2.0", "id": frame["id"], "result": result }))
    }

    pub(crate) fn chunk(text: &str) -> Act {
        Act::Send(json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": "sess-1",
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": { "type": "text", "text": text }
                }
            }
        }))
    }

    /// Answers the handshake; defers everything else to `on_other`.
    pub(crate) fn handshake_then<F>(
        mut on_other: F,
    ) -> impl FnMut(&Value) -> Vec<Act> + Send + 'static
    where
        F: FnMut(&Value) -> Vec<Act> + Send + 'static,
    {
        move |frame| match frame["method"].as_str() {
            Some("initialize") => vec![result(
                frame,
                json!({
                    "protocolVersion": 1,
                    "agentCapabilities": { "loadSession": false },
                    "agentInfo": { "name": "fake-agent", "version": "0.0.1" }
                }),
            )],
            Some("session/new") => vec![result(frame, json!({ "sessionId": "sess-1" }))],
            _ => on_other(frame),
        }
    }

    fn timeouts() -> ProtocolTimeouts {
        ProtocolTimeouts {
            handshake: Duration::from_secs(5),
            end_to_end: Duration::from_secs(10),
            read: Duration::from_secs(2),
        }
    }

    async fn ready_client<F>(script: F) -> (AgentProtocolClient, JoinHandle<Vec<Value>>)
    where
        F: FnMut(&Value) -> Vec<Act> + Send + 'static,
    {
        ready_client_with(script, timeouts()).await
    }

    async fn ready_client_with<F>(
        script: F,
        timeouts: ProtocolTimeouts,
    ) -> (AgentProtocolClient, JoinHandle<Vec<Value>>)
    where
        F: FnMut(&Value) -> Vec<Act> + Send + 'static,
    {
        let (transport, agent_end) = AgentTransport::pair(64 * 1024);
        let agent = spawn_agent(agent_end, handshake_then(script));
        let mut client = AgentProtocolClient::new(transport, timeouts);
        let sid = client.handshake("/workspace").await.unwrap();
        assert_eq!(sid, "sess-1");
        (client, agent)
    }

    async fn collect(mut stream: EventStream) -> Vec<EventResult> {
        let mut out = Vec::new();
        while let Some(item) = stream.next_event().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn prompt_streams_events_in_order() {
        let (client, agent) = ready_client(|frame| {
            if frame["method"] == "session/prompt" {
                vec![
                    chunk("Hel"),
                    Act::Send(json!({
                        "jsonrpc": "2.0",
                        "method": "session/update",
                        "params": {
                            "sessionId": "sess-1",
                            "update": {
                                "sessionUpdate": "available_commands_update",
                                "availableCommands": []
                            }
                        }
                    })),
                    chunk("lo"),
                    result(frame, json!({ "stopReason": "end_turn" })),
                ]
            } else {
                vec![]
            }
        })
        .await;
        assert_eq!(client.state(), SessionState::Ready);
        assert_eq!(client.agent_info().unwrap()["name"], "fake-agent");

        let stream = client.send_message("hi").await.unwrap();
        let events: Vec<_> = collect(stream).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                ProtocolEvent::AgentMessageChunk { text: "Hel".into() },
                ProtocolEvent::AgentMessageChunk { text: "lo".into() },
                ProtocolEvent::PromptResponse { stop_reason: "end_turn".into() },
            ]
        );
        assert_eq!(client.state(), SessionState::Ready);

        drop(client);
        let seen = agent.await.unwrap();
        let ids: Vec<u64> = seen.iter().filter_map(|f| f["id"].as_u64()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(seen[0]["params"]["protocolVersion"], 1);
        assert_eq!(seen[1]["params"]["cwd"], "/workspace");
        assert_eq!(seen[2]["params"]["prompt"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn handshake_times_out_against_silent_agent() {
        let (transport, agent_end) = AgentTransport::pair(1024);
        let _agent = spawn_agent(agent_end, |_| vec![]);
        let mut client = AgentProtocolClient::new(
            transport,
            ProtocolTimeouts {
                handshake: Duration::from_millis(200),
                ..timeouts()
            },
        );
        let err = client.handshake("/w").await.unwrap_err();
        assert!(matches!(err, SandboxError::HandshakeTimeout(_)));
        assert_eq!(client.state(), SessionState::Stopped);
        assert!(matches!(
            client.send_message("x").await,
            Err(SandboxError::SessionNotReady("stopped"))
        ));
    }

    #[tokio::test]
    async fn handshake_error_response_is_agent_error() {
        let (transport, agent_end) = AgentTransport::pair(1024);
        let _agent = spawn_agent(agent_end, |frame| {
            vec![Act::Send(json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "error": { "code": -32000, "message": "unsupported version" }
            }))]
        });
        let mut client = AgentProtocolClient::new(transport, timeouts());
        let err = client.handshake("/w").await.unwrap_err();
        assert!(matches!(err, SandboxError::Agent { code: -32000, .. }));
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn prompt_error_keeps_the_agent_code() {
        let (client, _agent) = ready_client(|frame| {
            if frame["method"] == "session/prompt" {
                vec![Act::Send(json!({
                    "jsonrpc": "2.0",
                    "id": frame["id"],
                    "error": { "code": -32603, "message": "model overloaded" }
                }))]
            } else {
                vec![]
            }
        })
        .await;
        let events = collect(client.send_message("hi").await.unwrap()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            *events[0].as_ref().unwrap(),
            ProtocolEvent::Error {
                message: "model overloaded".into(),
                code: Some(-32603),
            }
        );
        assert_eq!(client.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn second_prompt_while_streaming_is_busy() {
        let (client, _agent) = ready_client(|frame| {
            if frame["method"] == "session/prompt" {
                vec![chunk("working")]
            } else {
                vec![]
            }
        })
        .await;
        let mut first = client.send_message("one").await.unwrap();
        assert_eq!(client.state(), SessionState::Streaming);
        assert!(matches!(client.send_message("two").await, Err(SandboxError::Busy(_))));
        assert!(matches!(
            first.next_event().await,
            Some(Ok(ProtocolEvent::AgentMessageChunk { .. }))
        ));
    }

    #[tokio::test]
    async fn agent_requests_are_rejected() {
        let mut prompt_frame: Option<Value> = None;
        let (client, agent) = ready_client(move |frame| {
            if frame["method"] == "session/prompt" {
                prompt_frame = Some(frame.clone());
                vec![Act::Send(json!({
                    "jsonrpc": "2.0",
                    "id": "agent-req-1",
                    "method": "fs/read_text_file",
                    "params": { "path": "/etc/hosts" }
                }))]
            } else if frame["id"] == "agent-req-1" {
                let prompt = prompt_frame.take().unwrap();
                vec![result(&prompt, json!({ "stopReason": "end_turn" }))]
            } else {
                vec![]
            }
        })
        .await;

        let events = collect(client.send_message("read it").await.unwrap()).await;
        assert!(matches!(
            events.last(),
            Some(Ok(ProtocolEvent::PromptResponse { .. }))
        ));

        drop(client);
        let seen = agent.await.unwrap();
        let reply = seen.iter().find(|f| f["id"] == "agent-req-1").unwrap();
        assert_eq!(reply["error"]["code"], -32601);
        assert_eq!(reply["error"]["message"], "Method not supported: fs/read_text_file");
    }

    #[tokio::test]
    async fn isolated_malformed_frames_are_skipped() {
        let (transport, mut agent_end) = AgentTransport::pair(64 * 1024);
        let mut client = AgentProtocolClient::new(transport, timeouts());
        let handshake = tokio::spawn(async move {
            let sid = client.handshake("/w").await;
            (client, sid)
        });

        let mut lines = BufReader::new(&mut agent_end).lines();
        let init = lines.next_line().await.unwrap().unwrap();
        let init: Value = serde_json::from_str(&init).unwrap();
        drop(lines);
        let script = format!(
            "garbage\n{{\"not\":\"rpc\"}}\n{}\n",
            json!({ "jsonrpc": "2.0", "id": init["id"], "result": {} })
        );
        agent_end.write_all(script.as_bytes()).await.unwrap();

        let mut lines = BufReader::new(&mut agent_end).lines();
        let new = lines.next_line().await.unwrap().unwrap();
        let new: Value = serde_json::from_str(&new).unwrap();
        drop(lines);
        let reply = format!(
            "{}\n",
            json!({ "jsonrpc": "2.0", "id": new["id"], "result": { "sessionId": "s" } })
        );
        agent_end.write_all(reply.as_bytes()).await.unwrap();

        let (client, sid) = handshake.await.unwrap();
        assert_eq!(sid.unwrap(), "s");
        assert_eq!(client.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn three_malformed_frames_desync() {
        let (client, _agent) = ready_client(|frame| {
            if frame["method"] == "session/prompt" {
                vec![
                    chunk("partial"),
                    Act::Send(json!("nope")),
                    Act::Send(json!([1, 2, 3])),
                    Act::Send(json!({ "jsonrpc": "2.0" })),
                ]
            } else {
                vec![]
            }
        })
        .await;
        let events = collect(client.send_message("go").await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(ProtocolEvent::AgentMessageChunk { .. })));
        assert!(matches!(events[1], Err(SandboxError::ProtocolDesync(_))));
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn end_to_end_timeout_then_resync() {
        let mut prompts = 0;
        let (client, agent) = ready_client_with(
            move |frame| match frame["method"].as_str() {
                Some("session/prompt") => {
                    prompts += 1;
                    if prompts == 1 {
                        vec![chunk("thinking...")]
                    } else {
                        vec![chunk("second"), result(frame, json!({ "stopReason": "end_turn" }))]
                    }
                }
                // Late reply to the abandoned prompt (id 2) must be dropped.
                Some("session/cancel") => vec![
                    chunk("stale"),
                    Act::Send(json!({
                        "jsonrpc": "2.0",
                        "id": 2,
                        "result": { "stopReason": "cancelled" }
                    })),
                ],
                _ => vec![],
            },
            ProtocolTimeouts {
                handshake: Duration::from_secs(5),
                end_to_end: Duration::from_millis(400),
                read: Duration::from_millis(100),
            },
        )
        .await;

        let events = collect(client.send_message("slow").await.unwrap()).await;
        assert!(matches!(events[0], Ok(ProtocolEvent::AgentMessageChunk { .. })));
        assert!(matches!(events.last(), Some(Err(SandboxError::ProtocolTimeout(_)))));
        assert_eq!(client.state(), SessionState::Ready);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let events: Vec<_> = collect(client.send_message("again").await.unwrap())
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            events,
            vec![
                ProtocolEvent::AgentMessageChunk { text: "second".into() },
                ProtocolEvent::PromptResponse { stop_reason: "end_turn".into() },
            ]
        );

        drop(client);
        let seen = agent.await.unwrap();
        assert!(seen.iter().any(|f| f["method"] == "session/cancel"));
    }

    #[tokio::test]
    async fn dropping_stream_cancels_prompt() {
        let (client, agent) = ready_client(|frame| {
            if frame["method"] == "session/prompt" {
                vec![chunk("a"), chunk("b")]
            } else {
                vec![]
            }
        })
        .await;
        let mut stream = client.send_message("go").await.unwrap();
        assert!(stream.next_event().await.is_some());
        drop(stream);
        assert_eq!(client.state(), SessionState::Ready);

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);
        let seen = agent.await.unwrap();
        let cancel = seen.iter().find(|f| f["method"] == "session/cancel").unwrap();
        assert_eq!(cancel["params"]["sessionId"], "sess-1");
        assert!(cancel.get("id").is_none());
    }

    #[tokio::test]
    async fn agent_exit_mid_prompt_is_terminal_error() {
        let (client, _agent) = ready_client(|frame| {
            if frame["method"] == "session/prompt" {
                vec![chunk("bye"), Act::Close]
            } else {
                vec![]
            }
        })
        .await;
        let events = collect(client.send_message("go").await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            Ok(ProtocolEvent::Error { message, .. }) if message.contains("exited")
        ));
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn into_stream_yields_until_terminal() {
        let (client, _agent) = ready_client(|frame| {
            if frame["method"] == "session/prompt" {
                vec![chunk("x"), result(frame, json!({ "stopReason": "max_tokens" }))]
            } else {
                vec![]
            }
        })
        .await;
        let items: Vec<_> = client
            .send_message("go")
            .await
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[1],
            Ok(ProtocolEvent::PromptResponse { stop_reason }) if stop_reason == "max_tokens"
        ));
    }
}
