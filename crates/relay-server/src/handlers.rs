//! Connection handlers for the Relay server.
//!
//! This module owns the connection lifecycle: the Connect handshake, the
//! per-connection frame loop, and the cascade teardown on disconnect.

use crate::config::Config;
use crate::memory::{MemoryStore, TokenAuthenticator};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use relay_core::{
    Broadcast, Broker, BrokerConfig, ConnectionId, Delivery, HandlerResult, SessionId,
};
use relay_protocol::{codec, Frame, Version, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The topic broker.
    pub broker: Broker,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with the in-memory collaborators.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let broker_config = BrokerConfig {
            max_topics: config.limits.max_topics,
            max_joins_per_connection: config.limits.max_joins_per_connection,
            topic_capacity: 1024,
            node: config.node.clone(),
        };

        let store = Arc::new(MemoryStore::new());
        let broker = Broker::with_config(
            broker_config,
            Arc::new(TokenAuthenticator),
            store.clone(),
            store,
        );

        Self { broker, config }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// A joined topic: the session plus its fan-out forwarder task.
struct JoinEntry {
    session: SessionId,
    task: tokio::task::JoinHandle<()>,
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Handshake: nothing happens until a Connect frame authenticates.
    let Some(frame) = await_frame(&mut receiver, &mut sender, &mut read_buffer).await else {
        return;
    };
    let (version, token) = match frame {
        Frame::Connect { version, token } => (version, token),
        other => {
            warn!(frame_type = ?other.frame_type(), "Expected Connect frame");
            let _ = send_frame(&mut sender, &Frame::error(0, 1000, "expected connect")).await;
            return;
        }
    };
    let client_version = Version::new(version, 0);
    if !client_version.is_compatible_with(&PROTOCOL_VERSION) {
        let message = format!("unsupported protocol version {client_version}");
        let _ = send_frame(&mut sender, &Frame::error(0, 1000, message)).await;
        return;
    }
    if state.broker.stats().connection_count >= state.config.limits.max_connections {
        metrics::record_error("capacity");
        let _ = send_frame(&mut sender, &Frame::error(0, 1006, "server at capacity")).await;
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Delivery>();

    let connection = match state.broker.connect(token.as_deref(), outbound_tx.clone()).await {
        Ok(id) => id,
        Err(e) => {
            metrics::record_error("auth");
            let _ = send_frame(&mut sender, &Frame::error(0, 1001, e.to_string())).await;
            return;
        }
    };

    debug!(connection = %connection, "Connected");

    let connected = Frame::connected(
        connection.as_str(),
        PROTOCOL_VERSION.major,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        state.broker.disconnect(&connection).await;
        return;
    }

    // One forwarder task per joined topic.
    let mut joins: HashMap<String, JoinEntry> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            // Broadcasts and unicast pushes bound for this connection.
            Some(delivery) = outbound_rx.recv() => {
                let frame = Frame::broadcast(delivery.topic, delivery.event, delivery.payload);
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            // Inbound frames from the client.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > state.config.limits.max_message_size {
                            warn!(connection = %connection, size = data.len(), "Message too large");
                            metrics::record_error("oversize");
                            break;
                        }

                        let start = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    if let Err(e) = handle_frame(
                                        &frame,
                                        &connection,
                                        &state,
                                        &mut sender,
                                        &mut joins,
                                        &outbound_tx,
                                    ).await {
                                        error!(connection = %connection, error = %e, "Frame handling error");
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection, error = %e, "Protocol error");
                                    metrics::record_error("protocol");
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Text(_))) => {
                        warn!(connection = %connection, "Text frames are not supported");
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cascade teardown: forwarders, sessions, presence, registration.
    for (_, entry) in joins {
        entry.task.abort();
    }
    state.broker.disconnect(&connection).await;
    metrics::set_active_topics(state.broker.stats().topic_count);

    debug!(connection = %connection, "Disconnected");
}

/// Read frames until one decodes, answering WebSocket pings along the way.
///
/// Undecodable bytes end the connection: a peer that cannot produce a valid
/// frame before the handshake gets an error frame and is dropped, never
/// buffered indefinitely.
async fn await_frame(
    receiver: &mut SplitStream<WebSocket>,
    sender: &mut SplitSink<WebSocket, Message>,
    buf: &mut BytesMut,
) -> Option<Frame> {
    loop {
        match codec::decode_from(buf) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Protocol error before handshake");
                metrics::record_error("protocol");
                let _ = send_frame(sender, &Frame::error(0, 1000, e.to_string())).await;
                return None;
            }
        }
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
            Some(Ok(Message::Ping(data))) => {
                if sender.send(Message::Pong(data)).await.is_err() {
                    return None;
                }
            }
            Some(Ok(Message::Pong(_) | Message::Text(_))) => {}
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: &Frame,
    connection: &ConnectionId,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
    joins: &mut HashMap<String, JoinEntry>,
    outbound_tx: &mpsc::UnboundedSender<Delivery>,
) -> Result<()> {
    match frame {
        Frame::Join { id, topic, params } => {
            debug!(connection = %connection, topic = %topic, "Join request");

            let response = match state.broker.join(connection, topic, params.clone()).await {
                Ok(accept) => {
                    let task = spawn_forwarder(accept.session, accept.receiver, outbound_tx.clone());
                    joins.insert(topic.clone(), JoinEntry { session: accept.session, task });
                    metrics::record_join();
                    metrics::set_active_topics(state.broker.stats().topic_count);
                    Frame::reply_ok(*id, topic.clone(), accept.reply)
                }
                Err(e) => {
                    warn!(connection = %connection, topic = %topic, error = %e, "Join rejected");
                    metrics::record_error("join");
                    Frame::reply_error(*id, topic.clone(), json!({ "reason": e.to_string() }))
                }
            };

            send_frame(sender, &response).await?;
        }

        Frame::Leave { id, topic } => {
            debug!(connection = %connection, topic = %topic, "Leave request");

            let response = match joins.remove(topic.as_str()) {
                Some(entry) => {
                    entry.task.abort();
                    match state.broker.leave(entry.session).await {
                        Ok(()) => {
                            metrics::set_active_topics(state.broker.stats().topic_count);
                            Frame::reply_ok(*id, topic.clone(), Value::Null)
                        }
                        Err(e) => {
                            Frame::reply_error(*id, topic.clone(), json!({ "reason": e.to_string() }))
                        }
                    }
                }
                None => Frame::reply_error(*id, topic.clone(), json!({ "reason": "not joined" })),
            };

            send_frame(sender, &response).await?;
        }

        Frame::Event {
            id,
            topic,
            event,
            payload,
        } => {
            let Some(entry) = joins.get(topic.as_str()) else {
                let response = Frame::error(id.unwrap_or(0), 1009, format!("not joined: {topic}"));
                send_frame(sender, &response).await?;
                return Ok(());
            };

            match state.broker.handle_in(entry.session, event, payload.clone()).await {
                Ok(HandlerResult::Reply(value)) => {
                    if let Some(id) = id {
                        send_frame(sender, &Frame::reply_ok(*id, topic.clone(), value)).await?;
                    }
                }
                Ok(HandlerResult::NoReply) => {
                    if let Some(id) = id {
                        send_frame(sender, &Frame::reply_ok(*id, topic.clone(), Value::Null))
                            .await?;
                    }
                }
                Ok(HandlerResult::Error(value)) => {
                    metrics::record_error("event");
                    send_frame(sender, &Frame::reply_error(id.unwrap_or(0), topic.clone(), value))
                        .await?;
                }
                Err(e) => {
                    metrics::record_error("event");
                    send_frame(sender, &Frame::error(id.unwrap_or(0), 1009, e.to_string()))
                        .await?;
                }
            }
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Pong { .. } => {
            // Keepalive only
        }

        Frame::Connect { .. } => {
            debug!(connection = %connection, "Connect frame on established connection");
        }

        _ => {
            warn!(connection = %connection, frame_type = ?frame.frame_type(), "Unexpected frame type");
        }
    }

    Ok(())
}

/// Forward a topic's fan-out to the connection, honoring sender exclusion.
fn spawn_forwarder(
    session: SessionId,
    mut receiver: broadcast::Receiver<Arc<Broadcast>>,
    outbound: mpsc::UnboundedSender<Delivery>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(msg) => {
                    if !msg.delivers_to(session) {
                        continue;
                    }
                    if outbound.send(Delivery::from(msg.as_ref())).is_err() {
                        break; // Connection gone
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %session, skipped, "Fan-out receiver lagged");
                }
            }
        }
    })
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
