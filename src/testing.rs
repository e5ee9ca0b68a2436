//! An in-memory [`ServerConnection`] fake for tests.
//!
//! No real process, no real bytes, just enough bookkeeping for assertions
//! plus a way to inject inbound events and queue canned responses.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use lsp_types::{InitializeParams, InitializeResult};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::connection::{ClientNotification, ClientRequest, ServerConnection, ServerEvent, ServerResponse};

#[derive(Debug, thiserror::Error)]
pub enum FakeConnectionError {
    #[error("fake connection is closed")]
    Closed,
}

struct State {
    closed: bool,
    shutdown_called: bool,
    exit_called: bool,
    initialize_calls: u32,
    requests_sent: Vec<ClientRequest>,
    notifications_sent: Vec<ClientNotification>,
    queued_responses: HashMap<String, VecDeque<ServerResponse>>,
    /// Every call this connection has seen, in order — `"initialize"`,
    /// `"initialized"`, `"shutdown"`, `"exit"`, or the method name of a
    /// `send_request`/`send_notification` call. Lets tests assert on wire
    /// order across different call kinds, not just within one vector.
    call_log: Vec<String>,
}

/// A cheaply-cloneable fake [`ServerConnection`].
///
/// Clone it before handing one copy to a
/// [`LazyInitializer`](crate::initializer::LazyInitializer) or
/// [`Supervisor`](crate::supervisor::Supervisor) — the clones share the same
/// underlying state, so the one you kept can still push events and inspect
/// what was sent.
#[derive(Clone)]
pub struct FakeConnection {
    initialize_result: InitializeResult,
    state: Arc<Mutex<State>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>>,
}

impl FakeConnection {
    pub fn new(initialize_result: InitializeResult) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            initialize_result,
            state: Arc::new(Mutex::new(State {
                closed: false,
                shutdown_called: false,
                exit_called: false,
                initialize_calls: 0,
                requests_sent: Vec::new(),
                notifications_sent: Vec::new(),
                queued_responses: HashMap::new(),
                call_log: Vec::new(),
            })),
            event_tx,
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
        }
    }

    /// Push an inbound server-to-client event that a future call to
    /// [`ServerConnection::event_stream`] will yield.
    pub fn push_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Queue a canned response for the next `send_request` with this
    /// method name. FIFO per method.
    pub async fn queue_response(&self, method: impl Into<String>, response: ServerResponse) {
        self.state
            .lock()
            .await
            .queued_responses
            .entry(method.into())
            .or_default()
            .push_back(response);
    }

    pub async fn requests_sent(&self) -> Vec<ClientRequest> {
        self.state.lock().await.requests_sent.clone()
    }

    pub async fn notifications_sent(&self) -> Vec<ClientNotification> {
        self.state.lock().await.notifications_sent.clone()
    }

    pub async fn was_shutdown_called(&self) -> bool {
        self.state.lock().await.shutdown_called
    }

    pub async fn was_exit_called(&self) -> bool {
        self.state.lock().await.exit_called
    }

    pub async fn was_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn initialize_call_count(&self) -> u32 {
        self.state.lock().await.initialize_calls
    }

    /// The full ordered call trace — see [`State::call_log`].
    pub async fn call_log(&self) -> Vec<String> {
        self.state.lock().await.call_log.clone()
    }
}

#[async_trait]
impl ServerConnection for FakeConnection {
    type Error = FakeConnectionError;
    type Events = UnboundedReceiverStream<ServerEvent>;

    async fn initialize(
        &self,
        _params: InitializeParams,
    ) -> Result<InitializeResult, Self::Error> {
        let mut state = self.state.lock().await;
        state.initialize_calls += 1;
        state.call_log.push("initialize".to_string());
        Ok(self.initialize_result.clone())
    }

    async fn initialized(&self) -> Result<(), Self::Error> {
        self.state.lock().await.call_log.push("initialized".to_string());
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.shutdown_called = true;
        state.call_log.push("shutdown".to_string());
        Ok(())
    }

    async fn exit(&self) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.exit_called = true;
        state.call_log.push("exit".to_string());
        Ok(())
    }

    async fn send_request(&self, request: ClientRequest) -> Result<ServerResponse, Self::Error> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FakeConnectionError::Closed);
        }
        let response = state
            .queued_responses
            .get_mut(&request.method)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ServerResponse::ok(None));
        state.call_log.push(request.method.clone());
        state.requests_sent.push(request);
        Ok(response)
    }

    async fn send_notification(
        &self,
        notification: ClientNotification,
    ) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FakeConnectionError::Closed);
        }
        state.call_log.push(notification.method.clone());
        state.notifications_sent.push(notification);
        Ok(())
    }

    fn event_stream(&self) -> Self::Events {
        let rx = self
            .event_rx
            .try_lock()
            .expect("event_rx not contended at construction time")
            .take()
            .expect("FakeConnection::event_stream called more than once");
        UnboundedReceiverStream::new(rx)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}
