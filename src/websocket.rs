//! WebSocket transport
//!
//! Each connection gets its own `Session`. Inbound text frames are submissions;
//! outbound protocol messages are written by a dedicated writer task so a slow job
//! never blocks reading from the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::handlers::AppState;
use crate::protocol::ProtocolMessage;
use crate::session::{Session, Submission};

/// Client connection state
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Unique connection ID
    pub id: String,

    /// Client address
    pub ip_addr: Option<String>,

    /// When the connection was accepted
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl ConnectionState {
    /// Create new connection state
    pub fn new(id: String, ip_addr: Option<String>) -> Self {
        Self {
            id,
            ip_addr,
            connected_at: chrono::Utc::now(),
        }
    }
}

/// Tracks all active WebSocket connections
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// Active connections: connection_id -> state
    connections: Arc<RwLock<HashMap<String, ConnectionState>>>,

    /// Source of connection ids
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id
    pub async fn register(&self, ip_addr: Option<String>) -> String {
        let conn_id = format!("conn_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut connections = self.connections.write().await;
        connections.insert(conn_id.clone(), ConnectionState::new(conn_id.clone(), ip_addr));
        info!("WebSocket connected: {} (active: {})", conn_id, connections.len());
        conn_id
    }

    /// Whether another connection fits under `limit`
    pub async fn has_capacity(&self, limit: usize) -> bool {
        self.connections.read().await.len() < limit
    }

    /// Unregister a connection
    pub async fn unregister(&self, conn_id: &str) {
        let mut connections = self.connections.write().await;
        connections.remove(conn_id);
        info!("WebSocket disconnected: {} (active: {})", conn_id, connections.len());
    }

    /// Get number of active connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Get connection info by ID
    pub async fn get(&self, conn_id: &str) -> Option<ConnectionState> {
        self.connections.read().await.get(conn_id).cloned()
    }
}

/// GET /ws - upgrade to a job session
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let ip_addr = connect_info.map(|ConnectInfo(addr)| addr.to_string());
    let limit = state.config.server.max_ws_connections;

    if !state.registry.has_capacity(limit).await {
        warn!(limit, "Rejecting WebSocket connection: limit reached");
        return Err(ApiError::unavailable(format!(
            "Connection limit of {} reached",
            limit
        )));
    }

    let max_message_size = state.config.server.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, ip_addr)))
}

/// Drive one connection until the client goes away
async fn handle_socket(socket: WebSocket, state: AppState, ip_addr: Option<String>) {
    let conn_id = state.registry.register(ip_addr).await;
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ProtocolMessage>(state.config.session.outbound_buffer);
    let heartbeat = Duration::from_secs(state.config.server.ws_heartbeat_interval_secs);

    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(message) = outgoing else { break };
                    let frame = match message.to_json() {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(conn_id = %writer_conn, error = %e, "Failed to encode message");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        debug!(conn_id = %writer_conn, "Socket closed while sending");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = sink.close().await;
    });

    let mut session = Session::new(conn_id.clone(), Arc::clone(&state.env), state.config.session.clone(), tx);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                submit(&mut session, text).await;
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    submit(&mut session, text).await;
                }
                Err(_) => {
                    session
                        .send_error("submission rejected: binary frame is not valid UTF-8")
                        .await;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    if session.is_busy() {
        if let Some(job_id) = session.current_job() {
            debug!(conn_id = %conn_id, job_id = %job_id, "Connection closed with a running job");
        }
    }
    session.close();
    drop(session);
    writer.abort();
    state.registry.unregister(&conn_id).await;
}

/// Hand one inbound document to the session
async fn submit(session: &mut Session, text: String) {
    match session.on_inbound_text(text).await {
        Submission::Started(job_id) => {
            debug!(conn_id = %session.conn_id(), job_id = %job_id, "Job started");
        }
        Submission::Replaced { previous, started } => {
            debug!(conn_id = %session.conn_id(), previous = %previous, job_id = %started, "Job replaced");
        }
        Submission::Rejected { running } => {
            debug!(conn_id = %session.conn_id(), job_id = %running, "Submission rejected while busy");
        }
    }
}
