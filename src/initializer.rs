//! One-time handshake and capability tracking over a single connection
//! incarnation.
//!
//! `LazyInitializer` owns one [`ServerConnection`] for its whole lifetime: it
//! defers `initialize`/`initialized` until the first real call needs them,
//! coalesces concurrent first-callers onto a single handshake, and keeps a
//! running capability snapshot up to date as the server registers or
//! withdraws dynamic capabilities.
//!
//! The handshake sequence is: build `InitializeParams`, send `initialize`,
//! send `initialized`, record `ServerCapabilities`. A single
//! `Mutex`-guarded state machine is what gives concurrent first-callers
//! coalesced behavior — the lock is held for the whole sequence, so late
//! arrivals simply await its release and observe the cached result.

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use lsp_types::request::{RegisterCapability, Request, UnregisterCapability};
use lsp_types::{InitializeParams, RegistrationParams, ServerCapabilities, ServerInfo, UnregistrationParams};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::capabilities;
use crate::connection::{method, ClientNotification, ClientRequest, ServerConnection, ServerEvent};
use crate::error::InitializerError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Supplies a fresh [`InitializeParams`] on demand, e.g. to fill in
/// per-restart details such as a process id.
pub type InitializeParamsProvider = Arc<
    dyn Fn() -> BoxFuture<Result<InitializeParams, Box<dyn StdError + Send + Sync>>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitializerState {
    Uninitialized,
    Initialized,
    Shutdown,
}

/// Lazily performs (and remembers) the LSP handshake over one
/// [`ServerConnection`], and tracks the server's capability set as it
/// evolves via dynamic registration.
pub struct LazyInitializer<C: ServerConnection> {
    connection: Arc<C>,
    params_provider: InitializeParamsProvider,
    state: Arc<Mutex<InitializerState>>,
    capabilities: Arc<Mutex<ServerCapabilities>>,
    server_info: Arc<Mutex<Option<ServerInfo>>>,
    capabilities_tx: broadcast::Sender<ServerCapabilities>,
    last_published: Arc<Mutex<Option<serde_json::Value>>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    tap_task: JoinHandle<()>,
}

impl<C: ServerConnection> LazyInitializer<C> {
    /// Wrap `connection`, deferring the handshake until first use.
    ///
    /// `params_provider` is invoked exactly once per (re-)initialization,
    /// never speculatively.
    pub fn new(connection: C, params_provider: InitializeParamsProvider) -> Self {
        let connection = Arc::new(connection);
        let state = Arc::new(Mutex::new(InitializerState::Uninitialized));
        let capabilities = Arc::new(Mutex::new(ServerCapabilities::default()));
        let server_info = Arc::new(Mutex::new(None));
        let (capabilities_tx, _) = broadcast::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let last_published: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));

        let tap_task = {
            let raw_events = connection.event_stream();
            let state = state.clone();
            let capabilities = capabilities.clone();
            let capabilities_tx = capabilities_tx.clone();
            let last_published = last_published.clone();
            tokio::spawn(Self::run_event_tap(
                raw_events,
                event_tx,
                state,
                capabilities,
                capabilities_tx,
                last_published,
            ))
        };

        Self {
            connection,
            params_provider,
            state,
            capabilities,
            server_info,
            capabilities_tx,
            last_published,
            event_rx: Mutex::new(Some(event_rx)),
            tap_task,
        }
    }

    async fn run_event_tap(
        mut raw_events: C::Events,
        forward: mpsc::UnboundedSender<ServerEvent>,
        state: Arc<Mutex<InitializerState>>,
        capabilities: Arc<Mutex<ServerCapabilities>>,
        capabilities_tx: broadcast::Sender<ServerCapabilities>,
        last_published: Arc<Mutex<Option<serde_json::Value>>>,
    ) {
        while let Some(event) = raw_events.next().await {
            if matches!(*state.lock().await, InitializerState::Initialized) {
                match &event {
                    ServerEvent::Request {
                        method: m, params, ..
                    } if m == method::REGISTER_CAPABILITY => {
                        Self::apply_and_publish(
                            &capabilities,
                            &capabilities_tx,
                            &last_published,
                            |caps| {
                                if let Some(params) = params.clone() {
                                    match serde_json::from_value::<RegistrationParams>(params) {
                                        Ok(params) => {
                                            capabilities::apply_registrations(
                                                caps,
                                                &params.registrations,
                                            );
                                        }
                                        Err(e) => warn!(
                                            error = %e,
                                            "malformed {} params",
                                            RegisterCapability::METHOD
                                        ),
                                    }
                                }
                            },
                        )
                        .await;
                    }
                    ServerEvent::Request {
                        method: m, params, ..
                    } if m == method::UNREGISTER_CAPABILITY => {
                        Self::apply_and_publish(
                            &capabilities,
                            &capabilities_tx,
                            &last_published,
                            |caps| {
                                if let Some(params) = params.clone() {
                                    match serde_json::from_value::<UnregistrationParams>(params) {
                                        Ok(params) => {
                                            capabilities::apply_unregistrations(
                                                caps,
                                                &params.unregisterations,
                                            );
                                        }
                                        Err(e) => warn!(
                                            error = %e,
                                            "malformed {} params",
                                            UnregisterCapability::METHOD
                                        ),
                                    }
                                }
                            },
                        )
                        .await;
                    }
                    _ => {}
                }
            } else {
                trace!(method = event.method(), "event received before initialization; not tapped");
            }

            if forward.send(event).is_err() {
                break;
            }
        }
    }

    async fn apply_and_publish(
        capabilities: &Arc<Mutex<ServerCapabilities>>,
        capabilities_tx: &broadcast::Sender<ServerCapabilities>,
        last_published: &Arc<Mutex<Option<serde_json::Value>>>,
        apply: impl FnOnce(&mut ServerCapabilities),
    ) {
        let mut caps = capabilities.lock().await;
        apply(&mut caps);
        let snapshot = caps.clone();
        drop(caps);

        let as_value = serde_json::to_value(&snapshot).ok();
        let mut last_published = last_published.lock().await;
        if as_value != *last_published {
            *last_published = as_value;
            // No subscribers is not an error: the stream is opt-in.
            let _ = capabilities_tx.send(snapshot);
        }
    }

    /// Run the handshake if it hasn't happened yet. Concurrent callers
    /// coalesce onto a single handshake: the state lock is held for the
    /// whole sequence, so every other caller simply awaits its release and
    /// then observes the cached result.
    pub async fn initialize_if_needed(&self) -> Result<(), InitializerError<C::Error>> {
        let mut state = self.state.lock().await;
        match *state {
            InitializerState::Initialized => return Ok(()),
            InitializerState::Shutdown => {
                return Err(InitializerError::state_invalid(
                    "cannot initialize an initializer that has shut down",
                ));
            }
            InitializerState::Uninitialized => {}
        }

        let params = (self.params_provider)()
            .await
            .map_err(InitializerError::provider_failed)?;

        debug!("sending initialize request");
        let result = self.connection.initialize(params).await?;
        debug!("sending initialized notification");
        self.connection.initialized().await?;

        *self.capabilities.lock().await = result.capabilities.clone();
        *self.server_info.lock().await = result.server_info;
        *self.last_published.lock().await = serde_json::to_value(&result.capabilities).ok();
        let _ = self.capabilities_tx.send(result.capabilities);

        *state = InitializerState::Initialized;
        Ok(())
    }

    /// If not initialized, a no-op. Otherwise sends `shutdown`, transitions
    /// to `shutdown`, sends `exit`, and invalidates the connection — all
    /// under the same critical section so nothing can interleave with it.
    pub async fn shutdown_and_exit(&self) -> Result<(), InitializerError<C::Error>> {
        let mut state = self.state.lock().await;
        if !matches!(*state, InitializerState::Initialized) {
            return Ok(());
        }

        debug!("sending shutdown request");
        self.connection.shutdown().await?;
        *state = InitializerState::Shutdown;

        debug!("sending exit notification");
        self.connection.exit().await?;
        *state = InitializerState::Uninitialized;
        Ok(())
    }

    /// Force the state back to `uninitialized` without sending anything.
    /// Called externally when the transport reports the connection is
    /// dead.
    pub async fn invalidate_connection(&self) {
        *self.state.lock().await = InitializerState::Uninitialized;
    }

    /// The current capability snapshot, or `None` if not yet initialized.
    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        match *self.state.lock().await {
            InitializerState::Initialized => Some(self.capabilities.lock().await.clone()),
            _ => None,
        }
    }

    /// The server's self-reported name/version, if it sent one and we've
    /// initialized.
    pub async fn server_info(&self) -> Option<ServerInfo> {
        match *self.state.lock().await {
            InitializerState::Initialized => self.server_info.lock().await.clone(),
            _ => None,
        }
    }

    /// A never-closing stream of capability snapshots. Each value differs
    /// from the one immediately preceding it.
    pub fn capabilities_stream(&self) -> impl Stream<Item = ServerCapabilities> {
        BroadcastStream::new(self.capabilities_tx.subscribe()).filter_map(|r| r.ok())
    }

    /// Take ownership of the inbound event stream. Callable once per
    /// `LazyInitializer`; a second call panics.
    pub async fn take_event_stream(&self) -> UnboundedReceiverStream<ServerEvent> {
        let rx = self
            .event_rx
            .lock()
            .await
            .take()
            .expect("take_event_stream called more than once");
        UnboundedReceiverStream::new(rx)
    }

    /// Send an opaque request, forcing initialization first if needed.
    ///
    /// Panics if `request.method` is `"initialize"` — that handshake is
    /// owned entirely by this type and must never be issued directly.
    pub async fn send_request(
        &self,
        request: ClientRequest,
    ) -> Result<serde_json::Value, InitializerError<C::Error>> {
        assert_ne!(
            request.method,
            method::INITIALIZE,
            "initialize must not be sent through send_request; it is owned by LazyInitializer"
        );

        if request.method == method::SHUTDOWN {
            let mut state = self.state.lock().await;
            match *state {
                InitializerState::Uninitialized | InitializerState::Shutdown => {
                    return Ok(serde_json::Value::Null);
                }
                InitializerState::Initialized => {}
            }
            self.connection.shutdown().await?;
            *state = InitializerState::Shutdown;
            return Ok(serde_json::Value::Null);
        }

        self.initialize_if_needed().await?;
        let response = self.connection.send_request(request.clone()).await?;
        if let Some(error) = response.error {
            return Err(InitializerError::RequestDispatchFailed {
                method: request.method,
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    /// Send an opaque notification, forcing initialization first if needed.
    ///
    /// `exit` is dropped silently when the server was never initialized or
    /// has already shut down, since there is nothing left to tell.
    pub async fn send_notification(
        &self,
        notification: ClientNotification,
    ) -> Result<(), InitializerError<C::Error>> {
        assert_ne!(
            notification.method,
            method::INITIALIZED,
            "initialized must not be sent through send_notification; it is owned by LazyInitializer"
        );

        if notification.method == method::EXIT {
            let state = *self.state.lock().await;
            if matches!(
                state,
                InitializerState::Uninitialized | InitializerState::Shutdown
            ) {
                return Ok(());
            }
            self.connection.exit().await?;
            return Ok(());
        }

        self.initialize_if_needed().await?;
        self.connection.send_notification(notification).await?;
        Ok(())
    }

    /// Whether the handshake has completed.
    pub async fn is_initialized(&self) -> bool {
        matches!(*self.state.lock().await, InitializerState::Initialized)
    }
}

impl<C: ServerConnection> Drop for LazyInitializer<C> {
    fn drop(&mut self) {
        self.tap_task.abort();
    }
}
