use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::IntoResponse, routing::get};
use futures_util::stream::BoxStream;
use futures_util::{stream, SinkExt, StreamExt};
use graphql_ws_server::{
    Connections, Context, GraphQlService, NoOpWebSocketMetrics, OperationContext, OperationId,
    WebSocketServer, GRAPHQL_WS_PROTOCOL, SEC_WEBSOCKET_PROTOCOL,
};
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
    MaybeTlsStream, WebSocketStream,
};

/// Scripted execution service for driving the protocol engine.
#[allow(dead_code)]
#[derive(Clone)]
pub(crate) enum TestService {
    /// Yield the given payloads, then end the stream.
    Payloads(Vec<serde_json::Value>),
    /// Yield the given payloads, then block until cancelled.
    PayloadsThenBlock(Vec<serde_json::Value>),
    /// Fail the subscribe call with this message.
    Error(String),
    /// Never return from the subscribe call.
    Stall,
    /// Yield one payload echoing the connection header, then end.
    EchoHeader,
}

impl GraphQlService for TestService {
    type Payload = serde_json::Value;
    type Error = String;

    async fn subscribe(
        &self,
        ctx: OperationContext,
        _query: String,
        _operation_name: String,
        _variables: HashMap<String, serde_json::Value>,
    ) -> Result<BoxStream<'static, serde_json::Value>, String> {
        match self {
            Self::Payloads(payloads) => Ok(stream::iter(payloads.clone()).boxed()),
            Self::PayloadsThenBlock(payloads) => {
                Ok(stream::iter(payloads.clone()).chain(stream::pending()).boxed())
            }
            Self::Error(message) => Err(message.clone()),
            Self::Stall => {
                // Honors the service contract: cancelling the context
                // aborts the call.
                ctx.cancelled().await;
                Err("operation cancelled".to_string())
            }
            Self::EchoHeader => {
                let header = ctx
                    .header()
                    .map(|raw| serde_json::from_str(raw.get()).unwrap())
                    .unwrap_or(serde_json::Value::Null);
                Ok(stream::iter(vec![header]).boxed())
            }
        }
    }
}

#[allow(dead_code)]
pub(crate) struct ServerState {
    pub(crate) ws_server: WebSocketServer<TestService, NoOpWebSocketMetrics>,
    pub(crate) context: Context<TestService, NoOpWebSocketMetrics>,
}

#[allow(dead_code)]
pub(crate) struct TestServer {
    pub(crate) state: Arc<ServerState>,
    pub(crate) connections: Connections<TestService, NoOpWebSocketMetrics>,
    pub(crate) socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub(crate) server_handle: JoinHandle<()>,
}

#[allow(dead_code)]
pub(crate) async fn ws_handler(
    headers: axum::http::HeaderMap,
    State(state): State<Arc<ServerState>>,
    ws: axum::extract::ws::WebSocketUpgrade,
) -> impl IntoResponse {
    state
        .ws_server
        .upgrade_and_handle_websocket(ws, &headers, state.context.clone())
        .into_response()
}

#[allow(dead_code)]
pub(crate) async fn start_websocket_server(service: TestService) -> TestServer {
    start_websocket_server_inner(service, Duration::from_secs(1), None, true).await
}

#[allow(dead_code)]
pub(crate) async fn start_websocket_server_write_timeout(
    service: TestService,
    write_timeout: Duration,
) -> TestServer {
    start_websocket_server_inner(service, write_timeout, None, true).await
}

#[allow(dead_code)]
pub(crate) async fn start_websocket_server_read_limit(
    service: TestService,
    read_limit: usize,
) -> TestServer {
    start_websocket_server_inner(service, Duration::from_secs(1), Some(read_limit), true).await
}

#[allow(dead_code)]
pub(crate) async fn start_websocket_server_no_subprotocol(
    service: TestService,
) -> Result<TestServer, tungstenite::Error> {
    // Connecting without the graphql-ws subprotocol must be refused.
    try_start_websocket_server(service, Duration::from_secs(1), None, false).await
}

#[allow(dead_code)]
async fn start_websocket_server_inner(
    service: TestService,
    write_timeout: Duration,
    read_limit: Option<usize>,
    send_subprotocol: bool,
) -> TestServer {
    try_start_websocket_server(service, write_timeout, read_limit, send_subprotocol)
        .await
        .expect("Failed to connect to WebSocket server")
}

#[allow(dead_code)]
async fn try_start_websocket_server(
    service: TestService,
    write_timeout: Duration,
    read_limit: Option<usize>,
    send_subprotocol: bool,
) -> Result<TestServer, tungstenite::Error> {
    // Create a TCP listener
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Init context
    let mut context =
        Context::new(Arc::new(service), NoOpWebSocketMetrics).with_write_timeout(write_timeout);
    if let Some(read_limit) = read_limit {
        context = context.with_read_limit(read_limit);
    }

    let ws_server = WebSocketServer::new();
    let connections = ws_server.connections.clone();
    // Spawn a server
    let state = Arc::new(ServerState { ws_server, context });
    let router_state = state.clone();
    let server_handle = tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/ws", get(ws_handler))
            .with_state(router_state);

        axum::serve(listener, app).await.unwrap();
    });

    let url = format!("ws://{addr}/ws");
    let mut request = url.into_client_request().unwrap();
    if send_subprotocol {
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            GRAPHQL_WS_PROTOCOL.parse().unwrap(),
        );
    }
    let (socket, _response) = connect_async(request).await?;

    Ok(TestServer {
        state,
        connections,
        socket,
        server_handle,
    })
}

#[allow(dead_code)]
pub(crate) async fn assert_zero_connections_timeout(
    connections: Connections<TestService, NoOpWebSocketMetrics>,
) {
    // Closure of a websocket connection is not immediate. So, we keep checking zero connections
    // for at most 5 seconds.
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let conns = connections.0.read().await.len();
            if conns == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Connections are not empty");
}

#[allow(dead_code)]
pub(crate) async fn assert_zero_operations_timeout(
    connections: &Connections<TestService, NoOpWebSocketMetrics>,
) {
    // One connection should be present in an active test
    let connections = connections.0.read().await;
    let (_, connection) = connections.iter().next().unwrap();
    // Removal of an operation is not immediate. So, we keep checking zero operations
    // for at most 5 seconds.
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let operations = connection.operations.read().await.len();
            if operations == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Operations are not empty");
}

#[allow(dead_code)]
pub(crate) async fn check_operation_id(
    operation_id: &str,
    connections: &Connections<TestService, NoOpWebSocketMetrics>,
) {
    let operation_id = OperationId(operation_id.to_string());
    // One connection should be present in an active test
    let connections = connections.0.read().await;
    let (_, connection) = connections.iter().next().unwrap();
    assert!(connection.operations.read().await.contains_key(&operation_id));
}

#[allow(dead_code)]
pub(crate) async fn send_json(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    message: &serde_json::Value,
) {
    let json_message = serde_json::to_string(message).unwrap();
    socket
        .send(tungstenite::Message::Text(json_message))
        .await
        .unwrap();
}

#[allow(dead_code)]
pub(crate) async fn expect_text_message(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> String {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("Timed out waiting for a message")
        .unwrap();
    let message = message.unwrap();
    // Check text message
    let tungstenite::Message::Text(text_message) = message else {
        panic!("Expected text message");
    };
    text_message
}

#[allow(dead_code)]
pub(crate) async fn expect_json_message(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> serde_json::Value {
    let message = expect_text_message(socket).await;
    serde_json::from_str(message.as_str()).expect("Expected a valid JSON")
}

#[allow(dead_code)]
pub(crate) async fn expect_close_or_end(socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("Timed out waiting for the connection to close");
    match message {
        // Stream end or a transport error both mean the server is gone
        None | Some(Err(_)) => {}
        Some(Ok(message)) => {
            assert!(message.is_close(), "Expected close message");
        }
    }
}

#[allow(dead_code)]
pub(crate) async fn assert_connection_init(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    init_payload: serde_json::Value,
) {
    send_json(socket, &init_payload).await;
    // Check for connection_ack message
    let message_json = expect_json_message(socket).await;
    assert_eq!(message_json, serde_json::json!({"type": "connection_ack"}));
}

#[allow(dead_code)]
pub(crate) fn connection_init() -> serde_json::Value {
    serde_json::json!({
        "type": "connection_init",
        "payload": {}
    })
}

#[allow(dead_code)]
pub(crate) fn start_message(operation_id: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "start",
        "id": operation_id,
        "payload": {
            "operationName": null,
            "query": "subscription { tick }",
            "variables": {}
        }
    })
}

#[allow(dead_code)]
pub(crate) fn stop_message(operation_id: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "stop",
        "id": operation_id
    })
}
