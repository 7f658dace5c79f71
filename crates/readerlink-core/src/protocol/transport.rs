//! Byte transport seam
//!
//! The connection only needs immediate-return reads, raw writes and close.
//! [`SerialTransport`](super::serial::SerialTransport) is the production
//! implementation; [`SimulatedReader`](crate::demo::SimulatedReader) and the
//! test mocks implement the same trait.

use std::io;
use std::time::Duration;

/// A byte stream to a reader
pub trait Transport: Send {
    /// Human readable address, used in logs and errors
    fn name(&self) -> &str;

    /// Read whatever is available right now into `buf`.
    ///
    /// Returns `Ok(0)` when nothing is pending. Must not block indefinitely.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Configure a write timeout.
    ///
    /// Backends that cannot do this independently of reads return
    /// `io::ErrorKind::Unsupported`.
    fn set_write_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "write timeout not supported by this transport",
        ))
    }

    /// Release the underlying device
    fn close(&mut self) -> io::Result<()>;
}
