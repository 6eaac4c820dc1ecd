//! Reasons a new stream could not be opened.

use crate::pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Request details missing")]
    MissingRequest,

    #[error("No such kite {proto}://{host}:{port}")]
    NoSuchKite {
        proto: String,
        host: String,
        port: u16,
    },

    #[error("Backend allocation failed: {0}")]
    Pool(#[from] PoolError),

    #[error("Failed to connect {backend}: {source}")]
    Connect {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting {0}")]
    Timeout(String),
}
