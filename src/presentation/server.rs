//! Drives a [SessionManager] over a message transport.
//!
//! The transport is anything that exchanges text frames and can be closed
//! with a status, typically a WebSocket. The scenario deadline is enforced
//! here: while a scenario is outstanding, receiving is bounded by it.
use async_trait::async_trait;
use tokio::time::timeout_at;
use tracing::debug;

use super::session::{CloseStatus, Directive, SessionManager};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("could not encode outbound message: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait Transport: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The next text frame, or `None` once the peer has gone away.
    async fn recv(&mut self) -> Result<Option<String>, Self::Error>;

    async fn send(&mut self, frame: String) -> Result<(), Self::Error>;

    async fn close(&mut self, status: CloseStatus, reason: &str) -> Result<(), Self::Error>;
}

fn transport_error<E: std::error::Error + Send + Sync + 'static>(error: E) -> Error {
    Error::Transport(Box::new(error))
}

/// Run `session` until it closes.
///
/// Returns the close status sent, or `None` when the peer disconnected first.
pub async fn serve<T: Transport>(
    transport: &mut T,
    session: &mut SessionManager,
) -> Result<Option<CloseStatus>, Error> {
    loop {
        let received = match session.deadline() {
            Some(deadline) => timeout_at(deadline, transport.recv()).await.ok(),
            None => Some(transport.recv().await),
        };

        let reply = match received {
            Some(frame) => match frame.map_err(transport_error)? {
                Some(frame) => session.handle_frame(&frame),
                None => {
                    debug!(session = %session.id(), state = session.state().name(), "peer disconnected");
                    return Ok(None);
                }
            },
            None => session.handle_timeout(),
        };

        if let Some(frame) = reply.frame()? {
            transport.send(frame).await.map_err(transport_error)?;
        }
        if let Directive::Close { status, reason } = reply.directive {
            transport
                .close(status, &reason)
                .await
                .map_err(transport_error)?;
            return Ok(Some(status));
        }
    }
}
