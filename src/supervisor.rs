//! Crash-tolerant wrapper over [`LazyInitializer`]: lazy spawn, open-document
//! replay, throttled restart, and a stable external surface across process
//! incarnations.
//!
//! Generic over the connection type rather than over a concrete process
//! type, so an embedder can plug in whatever spawns a fresh
//! [`ServerConnection`] for the next incarnation — a child process, a
//! socket, or a fake in tests.

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use lsp_types::{
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, ServerCapabilities, ServerInfo,
    TextDocumentItem, Uri,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use crate::connection::{method, ClientNotification, ClientRequest, ServerConnection, ServerEvent};
use crate::error::{InitializerError, SupervisorConfigError, SupervisorError};
use crate::initializer::{InitializeParamsProvider, LazyInitializer};
use crate::open_documents::OpenDocumentSet;
use crate::stream_tap::StreamTap;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Default restart cool-down. Builder-configurable; only constraint is
/// that it must be non-zero.
pub const DEFAULT_RESTART_COOLDOWN: Duration = Duration::from_secs(5);

/// Asynchronously produces a fresh [`ServerConnection`] for a new process
/// incarnation.
pub type ServerProvider<C> = Arc<
    dyn Fn() -> BoxFuture<Result<C, Box<dyn StdError + Send + Sync>>> + Send + Sync,
>;

/// Asynchronously looks up the current content of an open document, for
/// replay after an unplanned restart.
pub type TextDocumentItemProvider = Arc<
    dyn Fn(Uri) -> BoxFuture<Result<TextDocumentItem, Box<dyn StdError + Send + Sync>>>
        + Send
        + Sync,
>;

enum SupervisorState<C: ServerConnection> {
    NotStarted,
    RestartNeeded,
    Running(Arc<LazyInitializer<C>>),
    ShuttingDown,
    Stopped(Instant),
}

/// Presents a persistent, server-like surface whose lifetime exceeds that
/// of any single backing process.
pub struct Supervisor<C: ServerConnection> {
    state: Mutex<SupervisorState<C>>,
    open_documents: Mutex<OpenDocumentSet>,
    server_provider: ServerProvider<C>,
    text_document_item_provider: TextDocumentItemProvider,
    initialize_params_provider: InitializeParamsProvider,
    restart_cooldown: Duration,
    event_tap: StreamTap<ServerEvent>,
    capabilities_tap: StreamTap<ServerCapabilities>,
}

impl<C: ServerConnection> Supervisor<C> {
    fn new(
        server_provider: ServerProvider<C>,
        text_document_item_provider: TextDocumentItemProvider,
        initialize_params_provider: InitializeParamsProvider,
        restart_cooldown: Duration,
    ) -> (Self, SupervisorStreams) {
        let (event_tap, event_stream) = StreamTap::new();
        let (capabilities_tap, capabilities_stream) = StreamTap::new();
        let supervisor = Self {
            state: Mutex::new(SupervisorState::NotStarted),
            open_documents: Mutex::new(OpenDocumentSet::new()),
            server_provider,
            text_document_item_provider,
            initialize_params_provider,
            restart_cooldown,
            event_tap,
            capabilities_tap,
        };
        (
            supervisor,
            SupervisorStreams {
                events: event_stream,
                capabilities: capabilities_stream,
            },
        )
    }

    /// Ensure a `LazyInitializer` is bound for the current incarnation,
    /// spawning one (and replaying open documents, if coming from
    /// `restartNeeded`) if needed.
    async fn ensure_running(&self) -> Result<Arc<LazyInitializer<C>>, SupervisorError<C::Error>> {
        let mut state = self.state.lock().await;
        match &*state {
            SupervisorState::Running(initializer) => return Ok(initializer.clone()),
            SupervisorState::ShuttingDown => return Err(SupervisorError::ServerStopped),
            SupervisorState::Stopped(_) => return Err(SupervisorError::ServerStopped),
            SupervisorState::NotStarted | SupervisorState::RestartNeeded => {}
        }

        let needs_replay = matches!(*state, SupervisorState::RestartNeeded);

        info!("spawning server connection");
        let connection = (self.server_provider)()
            .await
            .map_err(SupervisorError::spawn_failed)?;
        let initializer = Arc::new(LazyInitializer::new(
            connection,
            self.initialize_params_provider.clone(),
        ));

        self.event_tap
            .set_source(initializer.take_event_stream().await)
            .await;
        self.capabilities_tap
            .set_source(Box::pin(initializer.capabilities_stream()))
            .await;

        *state = SupervisorState::Running(initializer.clone());

        if needs_replay {
            self.replay(&initializer).await;
        }
        drop(state);

        Ok(initializer)
    }

    async fn replay(&self, initializer: &Arc<LazyInitializer<C>>) {
        let uris: Vec<Uri> = self.open_documents.lock().await.iter().cloned().collect();
        for uri in uris {
            let item = match (self.text_document_item_provider)(uri.clone()).await {
                Ok(item) => item,
                Err(e) => {
                    warn!(%uri, error = %e, "failed to look up document content for replay");
                    continue;
                }
            };
            let params = DidOpenTextDocumentParams {
                text_document: item,
            };
            let Ok(params) = serde_json::to_value(&params) else {
                warn!(%uri, "failed to serialize replayed didOpen");
                continue;
            };
            if let Err(e) = initializer
                .send_notification(ClientNotification::new(
                    method::DID_OPEN_TEXT_DOCUMENT,
                    Some(params),
                ))
                .await
            {
                warn!(%uri, error = %e, "failed to replay didOpen");
            }
        }
    }

    /// Send an opaque request, spawning the server if necessary.
    pub async fn send_request(
        &self,
        request: ClientRequest,
    ) -> Result<serde_json::Value, SupervisorError<C::Error>> {
        if request.method == method::SHUTDOWN {
            let state = self.state.lock().await;
            match &*state {
                SupervisorState::Running(_) => {}
                SupervisorState::ShuttingDown => return Err(SupervisorError::ServerStopped),
                SupervisorState::NotStarted
                | SupervisorState::RestartNeeded
                | SupervisorState::Stopped(_) => {
                    return Ok(serde_json::Value::Null);
                }
            }
        }

        let is_shutdown = request.method == method::SHUTDOWN;
        let initializer = self.ensure_running().await?;
        match initializer.send_request(request).await {
            Ok(value) => {
                if is_shutdown {
                    let mut state = self.state.lock().await;
                    if matches!(&*state, SupervisorState::Running(_)) {
                        *state = SupervisorState::NotStarted;
                        info!("supervisor shut down via raw request; next call will spawn fresh");
                    }
                }
                Ok(value)
            }
            Err(e) => {
                if matches!(e, InitializerError::Connection(_)) {
                    self.connection_invalidated().await;
                }
                Err(e.into())
            }
        }
    }

    /// Send an opaque notification, spawning the server if necessary.
    /// Intercepts `didOpen`/`didClose` to maintain the open-document set
    /// before forwarding, and drops `exit` outright if not running.
    pub async fn send_notification(
        &self,
        notification: ClientNotification,
    ) -> Result<(), SupervisorError<C::Error>> {
        if notification.method == method::DID_OPEN_TEXT_DOCUMENT {
            if let Some(uri) = extract_opened_uri(&notification) {
                self.open_documents.lock().await.open(uri);
            }
        } else if notification.method == method::DID_CLOSE_TEXT_DOCUMENT {
            if let Some(uri) = extract_closed_uri(&notification) {
                self.open_documents.lock().await.close(&uri);
            }
        } else if notification.method == method::EXIT {
            let state = self.state.lock().await;
            if !matches!(&*state, SupervisorState::Running(_)) {
                return Ok(());
            }
        }

        let initializer = self.ensure_running().await?;
        match initializer.send_notification(notification).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, InitializerError::Connection(_)) {
                    self.connection_invalidated().await;
                }
                Err(e.into())
            }
        }
    }

    /// Force initialization of the current (or a freshly spawned)
    /// incarnation, returning its capabilities.
    pub async fn initialize_if_needed(
        &self,
    ) -> Result<ServerCapabilities, SupervisorError<C::Error>> {
        let initializer = self.ensure_running().await?;
        initializer.initialize_if_needed().await?;
        Ok(initializer
            .capabilities()
            .await
            .expect("just completed initialization"))
    }

    /// Orderly shutdown: sends `shutdown`/`exit` to the running
    /// incarnation (if any) and returns to `notStarted`. A no-op if not
    /// currently running.
    pub async fn shutdown_and_exit(&self) -> Result<(), SupervisorError<C::Error>> {
        let mut state = self.state.lock().await;
        let initializer = match &*state {
            SupervisorState::Running(initializer) => initializer.clone(),
            _ => return Ok(()),
        };
        *state = SupervisorState::ShuttingDown;
        drop(state);

        initializer.shutdown_and_exit().await?;

        *self.state.lock().await = SupervisorState::NotStarted;
        info!("supervisor shut down; next call will spawn fresh");
        Ok(())
    }

    /// External hook: the embedding transport reports the connection is
    /// gone. Stamps `stopped(now)` and arms the cool-down; once it elapses
    /// with no intervening state change, the supervisor becomes
    /// `notStarted` (spawns with replay on the next call).
    pub async fn connection_invalidated(&self) {
        let mut state = self.state.lock().await;
        match &*state {
            SupervisorState::ShuttingDown => return,
            SupervisorState::Stopped(_) => return,
            _ => {}
        }
        let now = Instant::now();
        *state = SupervisorState::Stopped(now);
        warn!("connection invalidated; cooling down before restart");
        drop(state);

        tokio::time::sleep(self.restart_cooldown).await;

        let mut state = self.state.lock().await;
        if matches!(&*state, SupervisorState::Stopped(t) if *t == now) {
            *state = SupervisorState::RestartNeeded;
            debug!("cool-down elapsed; armed for restart with replay");
        }
    }

    /// The current capability snapshot, without forcing initialization.
    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        let state = self.state.lock().await;
        match &*state {
            SupervisorState::Running(initializer) => {
                let initializer = initializer.clone();
                drop(state);
                initializer.capabilities().await
            }
            _ => None,
        }
    }

    /// The server's self-reported name/version, if available.
    pub async fn server_info(&self) -> Option<ServerInfo> {
        let state = self.state.lock().await;
        match &*state {
            SupervisorState::Running(initializer) => {
                let initializer = initializer.clone();
                drop(state);
                initializer.server_info().await
            }
            _ => None,
        }
    }
}

/// The two long-lived streams a [`Supervisor`] presents to its caller,
/// returned once from [`SupervisorBuilder::build`].
pub struct SupervisorStreams {
    pub events: UnboundedReceiverStream<ServerEvent>,
    pub capabilities: UnboundedReceiverStream<ServerCapabilities>,
}

/// Builds a [`Supervisor`]. Required providers are validated at `.build()`
/// rather than tracked with phantom-typed builder states — there's no
/// separate test-only construction path; `FakeConnection` is simply what
/// `server_provider` returns in tests.
#[derive(Default)]
pub struct SupervisorBuilder<C> {
    server_provider: Option<ServerProvider<C>>,
    text_document_item_provider: Option<TextDocumentItemProvider>,
    initialize_params_provider: Option<InitializeParamsProvider>,
    restart_cooldown: Option<Duration>,
}

impl<C: ServerConnection> SupervisorBuilder<C> {
    pub fn new() -> Self {
        Self {
            server_provider: None,
            text_document_item_provider: None,
            initialize_params_provider: None,
            restart_cooldown: None,
        }
    }

    pub fn with_server_provider(mut self, provider: ServerProvider<C>) -> Self {
        self.server_provider = Some(provider);
        self
    }

    pub fn with_text_document_item_provider(mut self, provider: TextDocumentItemProvider) -> Self {
        self.text_document_item_provider = Some(provider);
        self
    }

    pub fn with_initialize_params_provider(mut self, provider: InitializeParamsProvider) -> Self {
        self.initialize_params_provider = Some(provider);
        self
    }

    pub fn with_restart_cooldown(mut self, cooldown: Duration) -> Self {
        self.restart_cooldown = Some(cooldown);
        self
    }

    pub fn build(self) -> Result<(Supervisor<C>, SupervisorStreams), SupervisorConfigError> {
        let server_provider = self
            .server_provider
            .ok_or_else(|| SupervisorConfigError::missing_field("server_provider"))?;
        let text_document_item_provider = self
            .text_document_item_provider
            .ok_or_else(|| SupervisorConfigError::missing_field("text_document_item_provider"))?;
        let initialize_params_provider = self
            .initialize_params_provider
            .ok_or_else(|| SupervisorConfigError::missing_field("initialize_params_provider"))?;
        let cooldown = self.restart_cooldown.unwrap_or(DEFAULT_RESTART_COOLDOWN);
        if cooldown.is_zero() {
            return Err(SupervisorConfigError::InvalidCooldown {
                cooldown,
                reason: "restart cool-down must be non-zero",
            });
        }

        Ok(Supervisor::new(
            server_provider,
            text_document_item_provider,
            initialize_params_provider,
            cooldown,
        ))
    }
}

fn extract_opened_uri(notification: &ClientNotification) -> Option<Uri> {
    let params = notification.params.clone()?;
    match serde_json::from_value::<DidOpenTextDocumentParams>(params) {
        Ok(params) => Some(params.text_document.uri),
        Err(e) => {
            warn!(error = %e, "malformed textDocument/didOpen params; open-document set not updated");
            None
        }
    }
}

fn extract_closed_uri(notification: &ClientNotification) -> Option<Uri> {
    let params = notification.params.clone()?;
    match serde_json::from_value::<DidCloseTextDocumentParams>(params) {
        Ok(params) => Some(params.text_document.uri),
        Err(e) => {
            warn!(error = %e, "malformed textDocument/didClose params; open-document set not updated");
            None
        }
    }
}
