//! Demo Mode - Simulated reader for testing
//!
//! A [`Transport`] that behaves like a reader on the other end of the wire.
//! Each write is treated as one command; the reply is released in randomly
//! sized fragments so callers see the same partial reads a real USB link
//! produces.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io;

use crate::protocol::{Transport, TERMINATOR};

/// Firmware string the simulated reader reports to the handshake command
pub const SIMULATED_FIRMWARE: &str = "TR265 SIMULATED V1.0";

/// Simulated reader
pub struct SimulatedReader {
    name: String,
    /// Bytes waiting to be read by the host
    pending: VecDeque<u8>,
    /// Never reply to anything
    silent: bool,
    closed: bool,
    /// Commands received so far, oldest first
    commands: Vec<String>,
    rng: StdRng,
}

impl Default for SimulatedReader {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedReader {
    /// Create a simulated reader with random fragmenting
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a simulated reader with reproducible fragmenting
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            name: "simulated".to_string(),
            pending: VecDeque::new(),
            silent: false,
            closed: false,
            commands: Vec::new(),
            rng,
        }
    }

    /// A reader that accepts writes but never answers
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Commands received so far
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Reply for one command, without terminator
    fn respond(command: &str) -> String {
        match command {
            "" => String::new(),
            "Z" => SIMULATED_FIRMWARE.to_string(),
            "V" => "V1.0".to_string(),
            cmd if cmd.starts_with("ECHO ") => cmd["ECHO ".len()..].to_string(),
            cmd => format!("ERROR: UNKNOWN COMMAND {}", cmd),
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "simulated reader closed",
            ));
        }
        Ok(())
    }
}

impl Transport for SimulatedReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        if self.pending.is_empty() || buf.is_empty() {
            return Ok(0);
        }
        let max = self.pending.len().min(buf.len());
        let n = self.rng.gen_range(1..=max);
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        let command = String::from_utf8_lossy(data)
            .trim_end_matches(&['\r', '\n'][..])
            .to_string();
        if !self.silent {
            let reply = Self::respond(&command);
            self.pending.extend(reply.as_bytes());
            self.pending.extend(TERMINATOR);
        }
        self.commands.push(command);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        self.pending.clear();
        Ok(())
    }
}
