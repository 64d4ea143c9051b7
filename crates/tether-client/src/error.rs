//! Binary-level errors.

/// Errors that end a client or server run.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The server address could not be resolved.
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        /// Address as configured.
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Resolution succeeded but produced no address.
    #[error("{0} resolved to no address")]
    NoAddress(String),

    /// Every connection attempt failed.
    #[error("no connection to {0} could be established")]
    NoSessions(std::net::SocketAddr),

    /// Listener or runtime I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
