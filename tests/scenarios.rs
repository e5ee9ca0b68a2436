//! End-to-end scenarios exercising the driver core's behavior, run against
//! [`FakeConnection`] instead of a real process/LSP-client pair.

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lsp_types::{
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, Registration, RegistrationParams,
    ServerCapabilities, TextDocumentIdentifier, TextDocumentItem, Uri,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio_stream::StreamExt;

use lsp_driver_core::connection::method;
use lsp_driver_core::testing::FakeConnection;
use lsp_driver_core::{ClientNotification, ClientRequest, ServerEvent, ServerResponse, SupervisorBuilder};

fn uri(s: &str) -> Uri {
    Uri::from_str(s).unwrap()
}

/// A provider that hands out fresh `FakeConnection`s and records every one
/// it creates, so a test can reach into the Nth incarnation after a
/// restart.
fn spawning_provider() -> (
    lsp_driver_core::ServerProvider<FakeConnection>,
    Arc<AsyncMutex<Vec<FakeConnection>>>,
) {
    let spawned = Arc::new(AsyncMutex::new(Vec::new()));
    let spawned_for_closure = spawned.clone();
    let provider = Arc::new(move || {
        let spawned = spawned_for_closure.clone();
        Box::pin(async move {
            let connection = FakeConnection::new(lsp_types::InitializeResult {
                capabilities: ServerCapabilities::default(),
                server_info: None,
            });
            spawned.lock().await.push(connection.clone());
            Ok(connection)
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<FakeConnection, Box<dyn std::error::Error + Send + Sync>>> + Send>>
    });
    (provider, spawned)
}

fn text_document_item_provider() -> lsp_driver_core::TextDocumentItemProvider {
    Arc::new(|requested_uri: Uri| {
        Box::pin(async move {
            Ok(TextDocumentItem {
                uri: requested_uri,
                language_id: "rust".into(),
                version: 1,
                text: String::new(),
            })
        })
    })
}

fn params_provider() -> lsp_driver_core::InitializeParamsProvider {
    Arc::new(|| Box::pin(async { Ok(lsp_types::InitializeParams::default()) }))
}

fn hover_request(target: &str) -> ClientRequest {
    ClientRequest::new(
        "textDocument/hover",
        Some(serde_json::json!({
            "textDocument": {"uri": target},
            "position": {"line": 0, "character": 0},
        })),
    )
}

fn did_open(u: &str) -> ClientNotification {
    ClientNotification::new(
        method::DID_OPEN_TEXT_DOCUMENT,
        Some(
            serde_json::to_value(DidOpenTextDocumentParams {
                text_document: TextDocumentItem {
                    uri: uri(u),
                    language_id: "rust".into(),
                    version: 1,
                    text: String::new(),
                },
            })
            .unwrap(),
        ),
    )
}

fn did_close(u: &str) -> ClientNotification {
    ClientNotification::new(
        method::DID_CLOSE_TEXT_DOCUMENT,
        Some(
            serde_json::to_value(DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri(u) },
            })
            .unwrap(),
        ),
    )
}

/// A. First hover lazily initializes.
#[tokio::test]
async fn scenario_a_first_hover_lazily_initializes() {
    let (provider, spawned) = spawning_provider();
    let (supervisor, _streams) = SupervisorBuilder::new()
        .with_server_provider(provider)
        .with_text_document_item_provider(text_document_item_provider())
        .with_initialize_params_provider(params_provider())
        .build()
        .unwrap();

    // Seed the hover response before the connection is even spawned is not
    // possible (it doesn't exist yet); instead drive the call and then
    // queue the response on the connection that gets created. Since our
    // fake always answers unseeded requests with `null`, seed after the
    // first spawn by pre-registering via a oneshot trick: spawn once via
    // initialize_if_needed, then queue, then hover.
    supervisor.initialize_if_needed().await.unwrap();
    let connections = spawned.lock().await;
    assert_eq!(connections.len(), 1);
    let connection = connections[0].clone();
    drop(connections);

    connection
        .queue_response(
            "textDocument/hover",
            ServerResponse::ok(Some(serde_json::json!({
                "contents": "abc",
                "range": {
                    "start": {"line": 0, "character": 0},
                    "end": {"line": 0, "character": 1},
                },
            }))),
        )
        .await;

    let result = supervisor
        .send_request(hover_request("file:///abc"))
        .await
        .unwrap();

    assert_eq!(result["contents"], "abc");
    assert_eq!(result["range"]["start"]["line"], 0);
    assert_eq!(result["range"]["end"]["character"], 1);

    assert_eq!(
        connection.call_log().await,
        vec!["initialize", "initialized", "textDocument/hover"],
    );
}

/// B. Dynamic registration updates capabilities.
#[tokio::test]
async fn scenario_b_dynamic_registration_updates_capabilities() {
    let (provider, spawned) = spawning_provider();
    let (supervisor, mut streams) = SupervisorBuilder::new()
        .with_server_provider(provider)
        .with_text_document_item_provider(text_document_item_provider())
        .with_initialize_params_provider(params_provider())
        .build()
        .unwrap();

    supervisor.initialize_if_needed().await.unwrap();
    let connection = spawned.lock().await[0].clone();

    // First snapshot on the stream is the one published by the handshake.
    let initial = streams.capabilities.next().await.unwrap();
    assert!(initial.semantic_tokens_provider.is_none());

    connection.push_event(ServerEvent::Request {
        id: serde_json::json!(1),
        method: method::REGISTER_CAPABILITY.to_string(),
        params: Some(
            serde_json::to_value(RegistrationParams {
                registrations: vec![Registration {
                    id: "1".into(),
                    method: "textDocument/semanticTokens".into(),
                    register_options: Some(serde_json::json!({
                        "legend": {"tokenTypes": [], "tokenModifiers": []},
                    })),
                }],
            })
            .unwrap(),
        ),
    });

    let updated = streams.capabilities.next().await.unwrap();
    assert!(updated.semantic_tokens_provider.is_some());
}

/// C. Crash and replay.
#[tokio::test]
async fn scenario_c_crash_and_replay() {
    let (provider, spawned) = spawning_provider();
    let (supervisor, _streams) = SupervisorBuilder::new()
        .with_server_provider(provider)
        .with_text_document_item_provider(text_document_item_provider())
        .with_initialize_params_provider(params_provider())
        .with_restart_cooldown(Duration::from_millis(20))
        .build()
        .unwrap();

    supervisor.send_notification(did_open("file:///u1")).await.unwrap();
    supervisor.send_notification(did_open("file:///u2")).await.unwrap();
    assert_eq!(spawned.lock().await.len(), 1);

    supervisor.connection_invalidated().await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    supervisor.send_request(hover_request("file:///u1")).await.unwrap();

    let connections = spawned.lock().await;
    assert_eq!(connections.len(), 2);
    let second = &connections[1];
    assert_eq!(
        second.call_log().await,
        vec![
            "initialize",
            "initialized",
            "textDocument/didOpen",
            "textDocument/didOpen",
            "textDocument/hover",
        ],
    );
    assert_eq!(
        second
            .notifications_sent()
            .await
            .iter()
            .map(|n| n.params.clone().unwrap()["textDocument"]["uri"].clone())
            .collect::<Vec<_>>(),
        vec![
            serde_json::json!("file:///u1"),
            serde_json::json!("file:///u2"),
        ],
    );
}

/// D. Shutdown while uninitialized.
#[tokio::test]
async fn scenario_d_shutdown_while_uninitialized() {
    let (provider, spawned) = spawning_provider();
    let (supervisor, _streams) = SupervisorBuilder::new()
        .with_server_provider(provider)
        .with_text_document_item_provider(text_document_item_provider())
        .with_initialize_params_provider(params_provider())
        .build()
        .unwrap();

    let result = supervisor
        .send_request(ClientRequest::new(method::SHUTDOWN, None))
        .await
        .unwrap();

    assert_eq!(result, serde_json::Value::Null);
    assert!(spawned.lock().await.is_empty());
}

/// E. Exit while uninitialized.
#[tokio::test]
async fn scenario_e_exit_while_uninitialized() {
    let (provider, spawned) = spawning_provider();
    let (supervisor, _streams) = SupervisorBuilder::new()
        .with_server_provider(provider)
        .with_text_document_item_provider(text_document_item_provider())
        .with_initialize_params_provider(params_provider())
        .build()
        .unwrap();

    supervisor
        .send_notification(ClientNotification::new(method::EXIT, None))
        .await
        .unwrap();

    assert!(spawned.lock().await.is_empty());
}

/// F. Concurrent first-use coalescing.
#[tokio::test]
async fn scenario_f_concurrent_first_use_coalescing() {
    let spawn_count = Arc::new(AtomicU32::new(0));
    let spawn_count_for_closure = spawn_count.clone();
    let provider: lsp_driver_core::ServerProvider<FakeConnection> = Arc::new(move || {
        let spawn_count = spawn_count_for_closure.clone();
        Box::pin(async move {
            spawn_count.fetch_add(1, Ordering::SeqCst);
            // The real handshake in this scenario takes ~50ms; model that
            // delay on the connection's own `initialize` via a queued slow
            // path isn't needed here — what matters is that only one
            // spawn (and hence one `initialize`) happens across 100
            // concurrent callers, which the supervisor's actor-serialized
            // spawn already guarantees regardless of handshake latency.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(FakeConnection::new(lsp_types::InitializeResult {
                capabilities: ServerCapabilities::default(),
                server_info: None,
            }))
        })
    });

    let (supervisor, _streams) = SupervisorBuilder::new()
        .with_server_provider(provider)
        .with_text_document_item_provider(text_document_item_provider())
        .with_initialize_params_provider(params_provider())
        .build()
        .unwrap();
    let supervisor = Arc::new(supervisor);

    let mut handles = Vec::new();
    for i in 0..100 {
        let supervisor = supervisor.clone();
        handles.push(tokio::spawn(async move {
            supervisor
                .send_request(hover_request(&format!("file:///{i}")))
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(spawn_count.load(Ordering::SeqCst), 1);
}

/// Invariant 1: the open-document set tracks didOpen/didClose exactly — a
/// closed document is not replayed after a restart.
#[tokio::test]
async fn invariant_closed_documents_are_not_replayed() {
    let (provider, spawned) = spawning_provider();
    let (supervisor, _streams) = SupervisorBuilder::new()
        .with_server_provider(provider)
        .with_text_document_item_provider(text_document_item_provider())
        .with_initialize_params_provider(params_provider())
        .with_restart_cooldown(Duration::from_millis(20))
        .build()
        .unwrap();

    supervisor.send_notification(did_open("file:///a")).await.unwrap();
    supervisor.send_notification(did_open("file:///b")).await.unwrap();
    supervisor.send_notification(did_close("file:///a")).await.unwrap();

    supervisor.connection_invalidated().await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    supervisor.send_request(hover_request("file:///b")).await.unwrap();

    let connections = spawned.lock().await;
    let second = &connections[1];
    let opened: Vec<_> = second
        .notifications_sent()
        .await
        .iter()
        .filter(|n| n.method == method::DID_OPEN_TEXT_DOCUMENT)
        .map(|n| n.params.clone().unwrap()["textDocument"]["uri"].clone())
        .collect();
    assert_eq!(opened, vec![serde_json::json!("file:///b")]);
}
