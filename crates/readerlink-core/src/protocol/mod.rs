//! Serial Protocol Communication
//!
//! Command/response protocol for Thinkify-style RFID readers: commands are
//! written raw, replies end with CR LF.

mod async_connection;
mod buffer;
mod connection;
mod error;
mod listener;
pub mod serial;
mod transport;

pub use async_connection::AsyncConnection;
pub use buffer::ReceiveBuffer;
pub use connection::{Connection, ConnectionConfig};
pub use error::ProtocolError;
pub use listener::ChunkObserver;
pub use serial::{list_ports, PortInfo, SerialTransport};
pub use transport::Transport;

/// Fixed baud rate for reader communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// End of every reply
pub const TERMINATOR: &[u8] = b"\r\n";

/// Command sent when a connection is created
pub const HANDSHAKE_COMMAND: &str = "Z";

/// Substring that marks a reply as a reader-side error
pub const DEVICE_ERROR_MARKER: &str = "UNKNOWN";

/// Default handshake window in milliseconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default reply poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default receive loop sleep after an empty read, in milliseconds
pub const DEFAULT_IDLE_INTERVAL_MS: u64 = 50;

/// Default maximum bytes per transport read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;
