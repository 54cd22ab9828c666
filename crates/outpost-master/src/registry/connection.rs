//! Handle to one live slave WebSocket.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use outpost_proto::Envelope;

/// Cloneable handle to a connection's writer task.
///
/// Everything sent through the handle is serialised by the single writer
/// task that owns the socket. Closing the handle asks the connection's read
/// loop to shut the socket down.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    /// Unique per accepted socket; distinguishes a reconnect from its predecessor.
    pub connection_id: Uuid,
    /// Certificate CN the connection authenticated as.
    pub hostname: String,
    /// Serial of the certificate presented on this connection.
    pub cert_serial: String,
    tx: mpsc::Sender<Envelope>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Create a handle over `tx`. The returned receiver flips to `true` when
    /// the handle is closed.
    pub fn new(
        hostname: impl Into<String>,
        cert_serial: impl Into<String>,
        tx: mpsc::Sender<Envelope>,
    ) -> (Self, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Self {
            connection_id: Uuid::new_v4(),
            hostname: hostname.into(),
            cert_serial: cert_serial.into(),
            tx,
            close_tx: Arc::new(close_tx),
        };
        (handle, close_rx)
    }

    /// Queue an envelope for the writer task.
    pub async fn send(&self, envelope: Envelope) -> Result<(), mpsc::error::SendError<Envelope>> {
        self.tx.send(envelope).await
    }

    /// Ask the connection to close. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// True once closed, or once the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow() || self.tx.is_closed()
    }
}
