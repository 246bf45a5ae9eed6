//! WebSocket signaling endpoints
//!
//! Each socket is wrapped in a [`WsTransport`] and handed to a
//! [`SignalingConnection`], which owns the whole per-socket protocol.
//! Outbound frames go through a bounded channel drained by a writer task,
//! so coordinator tasks never contend for the sink.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use roomcast_sfu::{PeerId, RoomId, SfuError, SignalMessage, SignalTransport, SignalingConnection};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{middleware::AuthUser, AppState};

/// Outbound frames buffered per socket before the client counts as stalled
const OUTBOUND_BUFFER: usize = 256;

/// [`SignalTransport`] over an axum WebSocket
pub struct WsTransport {
    outbound: mpsc::Sender<Message>,
    inbound: tokio::sync::Mutex<SplitStream<WebSocket>>,
    closed: CancellationToken,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Arc<Self> {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(sink, rx, closed.clone()));

        Arc::new(Self {
            outbound: tx,
            inbound: tokio::sync::Mutex::new(stream),
            closed,
        })
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            // drain queued frames before honouring a close
            biased;
            message = rx.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "WebSocket write failed");
                    closed.cancel();
                    return;
                }
            }
            () = closed.cancelled() => break,
        }
    }

    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(error = %e, "WebSocket close frame not sent");
    }
}

#[async_trait]
impl SignalTransport for WsTransport {
    async fn send(&self, message: &SignalMessage) -> roomcast_sfu::Result<()> {
        if self.closed.is_cancelled() {
            return Err(SfuError::Transport("socket closed".to_string()));
        }
        let text = message.encode()?;

        // A client that stops reading must not stall the room
        self.outbound
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SfuError::Transport("client too slow to consume signaling".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    SfuError::Transport("socket closed".to_string())
                }
            })
    }

    async fn read_message(&self) -> Option<roomcast_sfu::Result<String>> {
        let mut inbound = self.inbound.lock().await;
        loop {
            let frame = tokio::select! {
                () = self.closed.cancelled() => return None,
                frame = inbound.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    return Some(Err(SfuError::Transport(format!("WebSocket error: {e}"))));
                }
                // binary, ping and pong frames carry no signaling
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Publisher and subscriber socket; the client joins with a `join` event
pub async fn live_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    auth: AuthUser,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, ws, RoomId::new(room_id), auth.user_id, false)
}

/// Subscribe-only socket under the `<user>_viewer` identity, joined on connect
pub async fn viewer_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    auth: AuthUser,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let viewer = PeerId::viewer(auth.user_id.as_str());
    upgrade(state, ws, RoomId::new(room_id), viewer, true)
}

fn upgrade(
    state: AppState,
    ws: WebSocketUpgrade,
    room_id: RoomId,
    peer_id: PeerId,
    auto_join: bool,
) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            info!(room_id = %room_id, peer_id = %peer_id, auto_join, "WebSocket connection established");
            let transport = WsTransport::new(socket);
            let connection = SignalingConnection::new(
                state.directory,
                state.peer_factory,
                room_id,
                peer_id,
                transport,
            );
            connection.run(auto_join).await;
        })
}
