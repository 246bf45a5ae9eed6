use crate::error::Result;
use crate::message::SignalMessage;
use async_trait::async_trait;

/// Bidirectional signaling channel of one client socket.
///
/// Implementations serialize concurrent `send` calls internally; the
/// coordinator writes to the same transport from the sync engine, ICE
/// callbacks and lobby broadcasts at once.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn send(&self, message: &SignalMessage) -> Result<()>;

    /// Next inbound text frame, or `None` once the socket is gone.
    async fn read_message(&self) -> Option<Result<String>>;

    /// Close the socket. Safe to call more than once.
    async fn close(&self);
}
