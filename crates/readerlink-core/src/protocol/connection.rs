//! Connection management
//!
//! Owns the transport and the background receive loop, and runs
//! command/response transactions with the reader.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    listener::{ChunkObserver, ListenerSettings, RxListener, SharedTransport},
    serial::{list_ports, SerialTransport},
    ProtocolError, ReceiveBuffer, Transport, DEFAULT_HANDSHAKE_TIMEOUT_MS,
    DEFAULT_IDLE_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_READ_CHUNK_SIZE,
    DEVICE_ERROR_MARKER, HANDSHAKE_COMMAND, TERMINATOR,
};

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Device address (e.g. "/dev/ttyACM0" or "COM5")
    pub address: String,
    /// Turn replies containing "UNKNOWN" into [`ProtocolError::Device`]
    pub raise_errors: bool,
    /// Log every sent message and received payload
    pub debug_com: bool,
    /// How long the reader gets to answer the handshake
    pub handshake_timeout_ms: u64,
    /// Poll interval while waiting for a terminated reply
    pub poll_interval_ms: u64,
    /// Sleep between empty reads in the receive loop
    pub idle_interval_ms: u64,
    /// Maximum bytes taken from the transport per read
    pub read_chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            raise_errors: true,
            debug_com: false,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            idle_interval_ms: DEFAULT_IDLE_INTERVAL_MS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Defaults for the given device address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Handshake window
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            chunk_size: self.read_chunk_size,
            idle_interval: Duration::from_millis(self.idle_interval_ms.max(1)),
        }
    }
}

/// Pull the reply payload out of a buffer snapshot that contains the terminator.
///
/// The text is trimmed, then cut at the first terminator. A buffer holding
/// only the terminator yields an empty payload.
pub(crate) fn extract_payload(raw: &[u8]) -> String {
    if raw == TERMINATOR {
        return String::new();
    }
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    // Terminator is ASCII, so this is a char boundary
    let end = find_terminator(trimmed.as_bytes()).unwrap_or(trimmed.len());
    trimmed[..end].trim_end().to_string()
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
}

/// Command/response link to a reader
///
/// All transaction methods take `&mut self`: the receive buffer carries no
/// request identity, so only one exchange may be in flight.
pub struct Connection {
    name: String,
    transport: SharedTransport,
    buffer: Arc<ReceiveBuffer>,
    listener: RxListener,
    config: ConnectionConfig,
    handshake_reply: String,
    closed: bool,
}

impl Connection {
    /// Open the serial device at `address` with default settings
    pub fn open(address: &str) -> Result<Self, ProtocolError> {
        Self::connect(ConnectionConfig::new(address))
    }

    /// Open the serial device named in `config`
    pub fn connect(config: ConnectionConfig) -> Result<Self, ProtocolError> {
        Self::connect_with_observer(config, None)
    }

    /// Open the serial device named in `config`, reporting every received chunk to `observer`
    pub fn connect_with_observer(
        config: ConnectionConfig,
        observer: Option<ChunkObserver>,
    ) -> Result<Self, ProtocolError> {
        if config.debug_com {
            tracing::info!("Opening port: {}", config.address);
        }
        let transport = SerialTransport::open(&config.address)?;
        Self::with_transport(Box::new(transport), config, observer)
    }

    /// Try every listed serial port and return the first one with a
    /// responsive reader
    pub fn discover(
        base: &ConnectionConfig,
        observer: Option<ChunkObserver>,
    ) -> Result<Self, ProtocolError> {
        let ports = list_ports();
        if ports.is_empty() {
            return Err(ProtocolError::Connect("no serial ports found".to_string()));
        }

        let mut tried = Vec::with_capacity(ports.len());
        for port in ports {
            let config = ConnectionConfig {
                address: port.name.clone(),
                ..base.clone()
            };
            match Self::connect_with_observer(config, observer.clone()) {
                Ok(conn) => {
                    tracing::info!("reader found on {}", port.name);
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::debug!("no reader on {}: {}", port.name, e);
                    tried.push(port.name);
                }
            }
        }

        Err(ProtocolError::Connect(format!(
            "no reader responded on {}",
            tried.join(", ")
        )))
    }

    /// Start the receive loop on `transport` and run the handshake
    pub fn with_transport(
        mut transport: Box<dyn Transport>,
        config: ConnectionConfig,
        observer: Option<ChunkObserver>,
    ) -> Result<Self, ProtocolError> {
        let name = transport.name().to_string();

        match transport.set_write_timeout(Duration::ZERO) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                tracing::debug!("{}: write timeout unavailable ({}), continuing", name, e);
            }
            Err(e) => {
                let _ = transport.close();
                return Err(ProtocolError::Connect(format!(
                    "{}: failed to configure writes: {}",
                    name, e
                )));
            }
        }

        let transport: SharedTransport = Arc::new(Mutex::new(transport));
        let buffer = Arc::new(ReceiveBuffer::new());
        let listener = match RxListener::spawn(
            transport.clone(),
            buffer.clone(),
            observer,
            config.listener_settings(),
        ) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = lock_transport(&transport).close();
                return Err(ProtocolError::Connect(format!(
                    "{}: failed to start receive loop: {}",
                    name, e
                )));
            }
        };

        let mut conn = Self {
            name,
            transport,
            buffer,
            listener,
            config,
            handshake_reply: String::new(),
            closed: false,
        };

        match conn.handshake() {
            Ok(reply) => {
                tracing::debug!("{}: handshake reply {:?}", conn.name, reply);
                conn.handshake_reply = reply;
                Ok(conn)
            }
            Err(e) => {
                let name = conn.name.clone();
                if let Err(close_err) = conn.shutdown() {
                    tracing::warn!("{}: close after failed handshake: {}", name, close_err);
                }
                Err(ProtocolError::Connect(format!(
                    "{}: no reader responded: {}",
                    name, e
                )))
            }
        }
    }

    fn handshake(&mut self) -> Result<String, ProtocolError> {
        // A window too large to represent waits without bound
        let deadline = Instant::now().checked_add(self.config.handshake_timeout());
        self.buffer.clear();
        self.send(HANDSHAKE_COMMAND)?;
        // Any reply will do; content is not checked for error markers
        self.wait_for_reply(deadline, false)
    }

    /// Device address or transport name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// What the reader answered to the handshake
    pub fn handshake_reply(&self) -> &str {
        &self.handshake_reply
    }

    /// Whether replies containing "UNKNOWN" are raised as errors
    pub fn raise_errors(&self) -> bool {
        self.config.raise_errors
    }

    /// Enable or disable raising device error replies
    pub fn set_raise_errors(&mut self, raise: bool) {
        self.config.raise_errors = raise;
    }

    /// Whether traffic is traced
    pub fn debug_com(&self) -> bool {
        self.config.debug_com
    }

    /// Enable or disable tracing of sent messages and received payloads
    pub fn set_debug_com(&mut self, debug: bool) {
        self.config.debug_com = debug;
    }

    /// True while the background receive loop is alive
    pub fn is_listening(&self) -> bool {
        self.listener.is_running()
    }

    /// Write `message` to the reader as-is. No terminator is appended.
    pub fn send(&mut self, message: impl Display) -> Result<(), ProtocolError> {
        let message = message.to_string();
        if self.config.debug_com {
            tracing::info!("Sending: {:?}", message);
        }
        lock_transport(&self.transport)
            .write_all(message.as_bytes())
            .map_err(ProtocolError::Write)
    }

    /// Block until a terminated reply is buffered and return its payload.
    ///
    /// There is no timeout: if the reader never terminates a reply this
    /// never returns. Use [`receive_timeout`](Self::receive_timeout) for a
    /// bounded wait.
    pub fn receive(&mut self) -> Result<String, ProtocolError> {
        let check = self.config.raise_errors;
        self.wait_for_reply(None, check)
    }

    /// Like [`receive`](Self::receive), but gives up after `timeout`.
    /// On timeout the buffer is left as it was. A `timeout` past the end of
    /// the clock's range behaves like [`receive`](Self::receive).
    pub fn receive_timeout(&mut self, timeout: Duration) -> Result<String, ProtocolError> {
        let check = self.config.raise_errors;
        self.wait_for_reply(Instant::now().checked_add(timeout), check)
    }

    /// Clear stale input, send `message` and wait for its reply
    pub fn send_receive(&mut self, message: impl Display) -> Result<String, ProtocolError> {
        let sent = message.to_string();
        self.buffer.clear();
        self.send(&sent)
            .and_then(|()| self.receive())
            .map_err(|e| ProtocolError::Transaction {
                sent,
                source: Box::new(e),
            })
    }

    /// [`send_receive`](Self::send_receive) with a bound on the reply wait
    pub fn send_receive_timeout(
        &mut self,
        message: impl Display,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let sent = message.to_string();
        self.buffer.clear();
        self.send(&sent)
            .and_then(|()| self.receive_timeout(timeout))
            .map_err(|e| ProtocolError::Transaction {
                sent,
                source: Box::new(e),
            })
    }

    fn wait_for_reply(
        &mut self,
        deadline: Option<Instant>,
        check_errors: bool,
    ) -> Result<String, ProtocolError> {
        let started = Instant::now();
        let poll = self.config.poll_interval();

        let raw = loop {
            let snapshot = self.buffer.snapshot();
            if find_terminator(&snapshot).is_some() {
                break snapshot;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ProtocolError::Timeout(started.elapsed()));
                }
            }
            thread::sleep(poll);
        };

        let payload = extract_payload(&raw);
        if self.config.debug_com {
            tracing::info!("Received: {:?}", payload);
        }
        self.buffer.clear();

        if check_errors && payload.contains(DEVICE_ERROR_MARKER) {
            return Err(ProtocolError::Device(payload));
        }
        Ok(payload)
    }

    /// Stop the receive loop and close the transport
    pub fn close(mut self) -> Result<(), ProtocolError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.listener.stop();
        lock_transport(&self.transport).close()?;
        tracing::debug!("{}: connection closed", self.name);
        Ok(())
    }
}

fn lock_transport(transport: &SharedTransport) -> std::sync::MutexGuard<'_, Box<dyn Transport>> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("{}: error while closing: {}", self.name, e);
        }
    }
}
