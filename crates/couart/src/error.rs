//! Error kinds surfaced by the engine.

use couart_msg::{MessageError, Token, Type};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Nil/unsupported URL, wrong scheme, or an otherwise malformed
    /// request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Failed to read the request body.
    #[error("failed to read request body: {0}")]
    Body(#[from] std::io::Error),

    /// The client refused to start another parallel request.
    #[error("max parallel requests exhausted: {0}")]
    ParallelLimitExceeded(u32),

    /// A deadline, the ACK window, or the postponed-response window
    /// expired.
    #[error("timed out {}", if *.while_reading_body { "while reading the response body" } else { "waiting for a response" })]
    Timeout { while_reading_body: bool },

    /// The underlying byte stream is gone.
    #[error("transport closed")]
    TransportClosed,

    /// The serial provider could not open or enumerate ports.
    #[error("serial port: {0}")]
    Serial(String),

    /// The response's message id does not match the request it must
    /// confirm. Fatal for the round trip; the interaction is closed.
    #[error("message id mismatch: request {sent:#06x}, response {got:#06x}")]
    MessageIdMismatch { sent: u16, got: u16 },

    /// The response token differs from the request token. Fatal for the
    /// round trip; the interaction is closed.
    #[error("token mismatch: request {sent}, response {got}")]
    TokenMismatch { sent: Token, got: Token },

    /// The peer answered with a message type the state machine does not
    /// allow at this point.
    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedType { expected: &'static str, got: Type },

    /// Encode/decode failure, propagated verbatim.
    #[error("codec: {0}")]
    Codec(#[from] MessageError),

    /// The notification consumer vanished; the observation was torn
    /// down.
    #[error("no consumer for notifications")]
    ObserverGone,

    /// A second round trip was attempted while one is in flight on the
    /// same interaction.
    #[error("interaction {0} is busy with another round trip")]
    InteractionBusy(Token),

    /// Any round-trip failure, tagged with the interaction's token for
    /// diagnostics.
    #[error("round trip failed for token {token}: {source}")]
    Interaction {
        token: Token,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// True when the failure (possibly wrapped with a token) is a
    /// timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Interaction { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Unwraps the token-tagging layer, if any.
    pub fn root(&self) -> &Error {
        match self {
            Error::Interaction { source, .. } => source.root(),
            other => other,
        }
    }
}
