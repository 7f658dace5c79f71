//! Protocol errors

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a reader
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The transport could not be opened, or the reader never answered the handshake
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Writing to the transport failed
    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The reader replied with an error payload
    #[error("Reader reported an error: {0}")]
    Device(String),

    /// A `send_receive` exchange failed in either phase
    #[error("Transaction failed. Sent: {sent:?}. Got: {source}")]
    Transaction {
        /// The outbound message of the failed exchange
        sent: String,
        /// What went wrong
        #[source]
        source: Box<ProtocolError>,
    },

    /// No terminated reply arrived within the bound
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure outside a write
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// The innermost error, looking through any `Transaction` wrapper
    pub fn root(&self) -> &ProtocolError {
        match self {
            ProtocolError::Transaction { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the reader itself reported the failure
    pub fn is_device_error(&self) -> bool {
        matches!(self.root(), ProtocolError::Device(_))
    }
}
