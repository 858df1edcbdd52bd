use thiserror::Error;

/// Every fallible operation in this crate returns this error type.
pub type Result<T> = std::result::Result<T, LeapError>;

/// Error taxonomy for the LEAP client engine.
#[derive(Debug, Error)]
pub enum LeapError {
    /// The connection was closed (by the peer, or by a local `close()` call)
    /// while a request was still pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// A transport-level failure: TCP, TLS, or raw I/O.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A TLS-specific failure distinct from a generic I/O error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A request to `url` did not receive a response within the configured timeout.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The bridge responded with a non-2xx `StatusCode`.
    #[error("bridge returned {code} for {url}")]
    BridgeError { code: String, url: String },

    /// A command referenced a device, zone, or button id the model has never seen.
    #[error("unknown entity id {id}")]
    UnknownEntity { id: u64 },

    /// The physical button was not pressed within the pairing deadline.
    #[error("pairing timed out waiting for button press")]
    PairingTimeout,

    /// The bridge rejected the certificate signing request.
    #[error("bridge rejected pairing request")]
    PairingRejected,

    /// A transport failure specific to the pairing handshake.
    #[error("pairing transport error: {0}")]
    PairingTransport(String),

    /// A single line of the wire protocol failed to parse as JSON.
    #[error("failed to decode line: {raw}")]
    DecodeError { raw: String },

    /// A malformed or missing field in an otherwise well-formed JSON body.
    #[error("malformed message: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for LeapError {
    fn from(e: serde_json::Error) -> Self {
        LeapError::DecodeError { raw: e.to_string() }
    }
}

impl From<tokio::time::error::Elapsed> for LeapError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LeapError::Timeout { url: String::new() }
    }
}
