//! # readerlink Core Library
//!
//! Command/response communication with serial RFID readers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A background receive loop that drains the serial port into a shared buffer
//! - Synchronous `send` / `receive` / `send_receive` transactions framed by CR LF
//! - A bounded handshake that confirms a reader is attached
//! - Port discovery and a simulated reader for testing
//!
//! ## Example
//!
//! ```rust,ignore
//! use readerlink_core::protocol::Connection;
//!
//! let mut conn = Connection::open("/dev/ttyACM0")?;
//! let version = conn.send_receive("V")?;
//! println!("Firmware: {}", version);
//! conn.close()?;
//! ```

pub mod demo;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::demo::SimulatedReader;
    pub use crate::protocol::{
        AsyncConnection, ChunkObserver, Connection, ConnectionConfig, ProtocolError, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
