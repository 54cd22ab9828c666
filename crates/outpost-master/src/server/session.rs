//! One slave WebSocket: writer task, register handshake and message dispatch.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use outpost_proto::{
    Envelope, ErrorPayload, MasterToolCallPayload, MessageType, RegisterAck, RegisterPayload,
    Tool, ToolCallResponse,
};

use super::AppState;
use super::connect::SlaveIdentity;
use crate::registry::ConnectionHandle;
use crate::upstream::build_master_tools;

const OUTBOUND_CAPACITY: usize = 64;

/// Drive an authenticated socket until either side closes it.
pub(super) async fn run_socket(socket: WebSocket, state: AppState, identity: SlaveIdentity) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (handle, mut closed) = ConnectionHandle::new(&identity.hostname, &identity.serial, tx);
    let writer = tokio::spawn(write_loop(sink, rx, closed.clone()));

    let hostname = identity.hostname;
    let connection_id = handle.connection_id;
    let deadline = Instant::now() + state.handshake_timeout;
    let mut session = SlaveSession::new(state.clone(), handle.clone());

    loop {
        let text = tokio::select! {
            text = next_text(&mut stream) => text,
            _ = closed.changed() => break,
            () = sleep_until(deadline), if !session.is_registered() => {
                warn!(hostname, "Slave did not register in time, closing");
                break;
            }
        };
        let Some(text) = text else { break };
        session.handle_text(&text).await;
    }

    // A newer connection may already own the registry entry and keeps it.
    if session.is_registered() {
        state.registry.release(&hostname, connection_id).await;
    }
    // Calls sent on this socket can no longer be answered, even when a
    // reconnect replaced it.
    let failed = state.relay.fail_pending_on(connection_id);
    if failed > 0 {
        info!(hostname, failed, "Failed pending calls of closed connection");
    }
    handle.close();
    drop(session);
    let _ = writer.await;
    debug!(hostname, %connection_id, "Slave connection finished");
}

/// Next text frame, skipping control and binary frames. `None` once the
/// socket is closed or broken.
async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) => return None,
            Ok(Message::Binary(_)) => debug!("Ignoring binary frame"),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                debug!(error = %e, "WebSocket read failed");
                return None;
            }
        }
    }
    None
}

/// Sole writer of the socket.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Envelope>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = closed.changed() => break,
            next = rx.recv() => {
                let Some(envelope) = next else { break };
                let json = match envelope.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(msg_type = %envelope.msg_type, error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    debug!(error = %e, "WebSocket write failed");
                    return;
                }
            }
        }
    }

    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "closing".into(),
        })))
        .await;
}

/// Queue `payload` as a `kind` envelope with correlation `id`.
async fn send_payload<T: Serialize>(
    handle: &ConnectionHandle,
    kind: MessageType,
    id: &str,
    payload: &T,
) {
    let envelope = match Envelope::with_payload(kind, id, payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(hostname = %handle.hostname, msg_type = %kind, error = %e, "Failed to encode payload");
            return;
        }
    };
    if handle.send(envelope).await.is_err() {
        debug!(hostname = %handle.hostname, msg_type = %kind, "Connection writer gone");
    }
}

/// Inbound message handling for one connection.
///
/// Messages are processed in arrival order. Until `register` succeeds every
/// other message is dropped.
pub(super) struct SlaveSession {
    state: AppState,
    handle: ConnectionHandle,
    registered: bool,
}

impl SlaveSession {
    pub(super) const fn new(state: AppState, handle: ConnectionHandle) -> Self {
        Self {
            state,
            handle,
            registered: false,
        }
    }

    pub(super) const fn is_registered(&self) -> bool {
        self.registered
    }

    fn hostname(&self) -> &str {
        &self.handle.hostname
    }

    pub(super) async fn handle_text(&mut self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(hostname = self.hostname(), error = %e, "Dropping malformed message");
                return;
            }
        };
        let Some(kind) = envelope.kind() else {
            warn!(hostname = self.hostname(), msg_type = %envelope.msg_type, "Dropping message of unknown type");
            return;
        };
        if !self.registered && kind != MessageType::Register {
            debug!(hostname = self.hostname(), msg_type = %kind, "Dropping message sent before register");
            return;
        }

        match kind {
            MessageType::Register => self.on_register(&envelope).await,
            MessageType::Heartbeat => self.on_heartbeat().await,
            MessageType::ToolUpdate => self.on_tool_update(&envelope).await,
            MessageType::Response | MessageType::Error => {
                self.state.relay.resolve(envelope).await;
            }
            MessageType::MasterToolCall => self.on_master_tool_call(envelope).await,
            MessageType::ToolCall
            | MessageType::Restart
            | MessageType::Upgrade
            | MessageType::MasterTools => {
                warn!(hostname = self.hostname(), msg_type = %kind, "Dropping master-to-slave message sent by slave");
            }
        }
    }

    async fn on_register(&mut self, envelope: &Envelope) {
        let payload: RegisterPayload = match envelope.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(hostname = self.hostname(), error = %e, "Invalid register payload");
                send_payload(
                    &self.handle,
                    MessageType::Error,
                    &envelope.id,
                    &ErrorPayload {
                        error: format!("invalid register payload: {e}"),
                    },
                )
                .await;
                return;
            }
        };

        let hostname = self.handle.hostname.clone();
        if !payload.hostname.is_empty() && payload.hostname != hostname {
            warn!(hostname, claimed = %payload.hostname, "Ignoring in-band hostname that differs from certificate");
        }

        self.state
            .registry
            .connect(&hostname, payload.tools, &payload.version, self.handle.clone())
            .await;
        self.registered = true;

        if !payload.version.is_empty() {
            if let Err(e) = self
                .state
                .store
                .update_slave_version(&hostname, &payload.version)
                .await
            {
                warn!(hostname, error = %e, "Failed to persist slave version");
            }
        }
        self.touch_last_seen().await;

        send_payload(
            &self.handle,
            MessageType::Response,
            &envelope.id,
            &RegisterAck {
                status: "registered".into(),
            },
        )
        .await;

        self.push_master_tools();
    }

    async fn on_heartbeat(&self) {
        if !self.state.registry.heartbeat(self.hostname()).await {
            debug!(hostname = self.hostname(), "Heartbeat from slave no longer registered");
            return;
        }
        self.touch_last_seen().await;
    }

    async fn on_tool_update(&self, envelope: &Envelope) {
        match envelope.payload::<Vec<Tool>>() {
            Ok(tools) => {
                self.state.registry.update_tools(self.hostname(), tools).await;
            }
            Err(e) => warn!(hostname = self.hostname(), error = %e, "Dropping invalid tool_update"),
        }
    }

    /// Run the upstream call off the read loop and answer with one `response`.
    async fn on_master_tool_call(&self, envelope: Envelope) {
        let call: MasterToolCallPayload = match envelope.payload() {
            Ok(call) => call,
            Err(e) => {
                send_payload(
                    &self.handle,
                    MessageType::Response,
                    &envelope.id,
                    &ToolCallResponse::failed(format!("invalid master_tool_call payload: {e}")),
                )
                .await;
                return;
            }
        };

        let upstream = std::sync::Arc::clone(&self.state.upstream);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let name = format!("{}_{}", call.server, call.tool);
            debug!(hostname = %handle.hostname, tool = %name, "Slave calling master tool");
            let reply = match upstream.call_tool(&name, call.arguments).await {
                Ok(result) => ToolCallResponse::ok(result),
                Err(e) => {
                    warn!(hostname = %handle.hostname, tool = %name, error = %e, "Master tool call failed");
                    ToolCallResponse::failed(e.to_string())
                }
            };
            send_payload(&handle, MessageType::Response, &envelope.id, &reply).await;
        });
    }

    fn push_master_tools(&self) {
        let upstream = std::sync::Arc::clone(&self.state.upstream);
        let contexts = std::sync::Arc::clone(&self.state.contexts);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            match build_master_tools(upstream.as_ref(), contexts.as_ref(), &handle.hostname).await {
                Ok(payload) => {
                    let server_count = payload.servers.len();
                    send_payload(
                        &handle,
                        MessageType::MasterTools,
                        &Uuid::new_v4().to_string(),
                        &payload,
                    )
                    .await;
                    debug!(hostname = %handle.hostname, servers = server_count, "Pushed master tools");
                }
                Err(e) => {
                    warn!(hostname = %handle.hostname, error = %e, "Failed to build master tools");
                }
            }
        });
    }

    async fn touch_last_seen(&self) {
        if let Err(e) = self.state.store.update_slave_last_seen(self.hostname()).await {
            warn!(hostname = self.hostname(), error = %e, "Failed to update last_seen");
        }
    }
}
