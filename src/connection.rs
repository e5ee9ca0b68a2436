//! The external boundary: a byte-level-agnostic, bidirectional JSON-RPC peer.
//!
//! An `async_trait` abstraction the core depends on, with a hand-written
//! fake standing in for a real transport in tests (see
//! [`crate::testing::FakeConnection`]).
//!
//! Everything this crate sends or receives beyond the handshake messages is
//! opaque JSON — the driver core does not parse `textDocument/hover` params
//! any more than it parses `workspace/symbol` ones. It only switches on the
//! method names listed in [`method`].

use async_trait::async_trait;
use lsp_types::{InitializeParams, InitializeResult};
use serde_json::Value;
use tokio_stream::Stream;

/// Well-known method names the core recognizes and treats specially.
///
/// Everything else passes through [`ClientRequest::Other`] /
/// [`ClientNotification::Other`] / [`ServerEvent`] untouched.
pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";
    pub const DID_OPEN_TEXT_DOCUMENT: &str = "textDocument/didOpen";
    pub const DID_CLOSE_TEXT_DOCUMENT: &str = "textDocument/didClose";
    pub const REGISTER_CAPABILITY: &str = "client/registerCapability";
    pub const UNREGISTER_CAPABILITY: &str = "client/unregisterCapability";
}

/// An outbound, client-to-server request the core does not itself
/// interpret beyond its method name.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: String,
    pub params: Option<Value>,
}

impl ClientRequest {
    pub fn new(method: impl Into<String>, params: impl Into<Option<Value>>) -> Self {
        Self {
            method: method.into(),
            params: params.into(),
        }
    }
}

/// An outbound, client-to-server notification the core does not itself
/// interpret beyond its method name.
#[derive(Debug, Clone)]
pub struct ClientNotification {
    pub method: String,
    pub params: Option<Value>,
}

impl ClientNotification {
    pub fn new(method: impl Into<String>, params: impl Into<Option<Value>>) -> Self {
        Self {
            method: method.into(),
            params: params.into(),
        }
    }
}

/// The reply to a [`ClientRequest`].
///
/// Mirrors a JSON-RPC response body: exactly one of `result`/`error` is
/// meaningful.
#[derive(Debug, Clone, Default)]
pub struct ServerResponse {
    pub result: Option<Value>,
    pub error: Option<ResponseError>,
}

impl ServerResponse {
    pub fn ok(result: impl Into<Option<Value>>) -> Self {
        Self {
            result: result.into(),
            error: None,
        }
    }
}

/// A JSON-RPC error object returned in place of a result.
#[derive(Debug, Clone, thiserror::Error)]
#[error("LSP error {code}: {message}")]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

/// An inbound, server-to-client message: either a notification or a
/// request awaiting a reply.
///
/// This is what [`ServerConnection::event_stream`] yields, and what
/// [`crate::stream_tap::StreamTap`] fans out to the supervisor's
/// consumers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Notification {
        method: String,
        params: Option<Value>,
    },
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
}

impl ServerEvent {
    pub fn method(&self) -> &str {
        match self {
            ServerEvent::Notification { method, .. } => method,
            ServerEvent::Request { method, .. } => method,
        }
    }
}

/// A byte-level-agnostic, bidirectional peer for one server process
/// incarnation.
///
/// Implementations own the actual transport (stdio pipes, a socket, an
/// in-memory fake for tests) and the request/response correlation that
/// goes with it. This trait only exposes the surface the driver core
/// needs: canned handshake/shutdown calls, opaque request/notification
/// dispatch, and a stream of inbound events.
#[async_trait]
pub trait ServerConnection: Send + Sync + 'static {
    /// The error type surfaced by this connection's own I/O.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The concrete stream type yielded by [`Self::event_stream`].
    type Events: Stream<Item = ServerEvent> + Send + Unpin + 'static;

    /// Send the `initialize` request and await its result.
    async fn initialize(
        &self,
        params: InitializeParams,
    ) -> Result<InitializeResult, Self::Error>;

    /// Send the `initialized` notification.
    async fn initialized(&self) -> Result<(), Self::Error>;

    /// Send the `shutdown` request.
    async fn shutdown(&self) -> Result<(), Self::Error>;

    /// Send the `exit` notification.
    async fn exit(&self) -> Result<(), Self::Error>;

    /// Send an arbitrary request, opaque beyond its method name, and await
    /// the reply.
    async fn send_request(
        &self,
        request: ClientRequest,
    ) -> Result<ServerResponse, Self::Error>;

    /// Send an arbitrary notification, opaque beyond its method name.
    async fn send_notification(
        &self,
        notification: ClientNotification,
    ) -> Result<(), Self::Error>;

    /// A stream of inbound server-to-client notifications and requests.
    ///
    /// Implementations should produce a fresh, independent stream each
    /// call is not required — the driver core calls this exactly once per
    /// connection incarnation.
    fn event_stream(&self) -> Self::Events;

    /// Tear down the underlying transport. Idempotent.
    async fn close(&self) -> Result<(), Self::Error>;
}
