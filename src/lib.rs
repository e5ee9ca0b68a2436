//! The stateful core of a client-side Language Server Protocol (LSP)
//! driver: the layers that sit between a raw bidirectional JSON-RPC
//! transport and an editor/IDE caller.
//!
//! Three collaborating pieces:
//!
//! - [`stream_tap::StreamTap`] — a dynamic fan-out primitive that lets a
//!   supervisor present one stable stream to callers while switching which
//!   inner source feeds it.
//! - [`initializer::LazyInitializer`] — performs the LSP handshake on first
//!   use and tracks server-announced capability changes over one
//!   connection incarnation.
//! - [`supervisor::Supervisor`] — wraps the initializer with crash-tolerant
//!   restart, open-document replay, and a throttled restart policy.
//!
//! This crate does not frame JSON-RPC bytes, spawn subprocesses, or watch
//! the filesystem — it consumes an embedding-supplied
//! [`connection::ServerConnection`] that already does those things over
//! whatever transport the caller chooses (child-process stdio, a pipe, a
//! socket). It also does not model the LSP message schema beyond the
//! handful of method names it must special-case: `initialize`,
//! `initialized`, `shutdown`, `exit`, `textDocument/didOpen`,
//! `textDocument/didClose`, `client/registerCapability`,
//! `client/unregisterCapability`. Everything else passes through opaquely.

pub mod capabilities;
pub mod connection;
pub mod error;
pub mod initializer;
pub mod open_documents;
pub mod stream_tap;
pub mod supervisor;
pub mod testing;

pub use connection::{ClientNotification, ClientRequest, ServerConnection, ServerEvent, ServerResponse};
pub use error::{InitializerError, SupervisorConfigError, SupervisorError};
pub use initializer::{InitializeParamsProvider, LazyInitializer};
pub use open_documents::OpenDocumentSet;
pub use stream_tap::StreamTap;
pub use supervisor::{ServerProvider, Supervisor, SupervisorBuilder, SupervisorStreams, TextDocumentItemProvider};
