use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use readerlink_core::demo::SimulatedReader;
use readerlink_core::protocol::{
    ChunkObserver, Connection, ConnectionConfig, ProtocolError, Transport,
};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Shared state of the mock wire, inspectable from the test
#[derive(Default)]
struct WireState {
    /// Bytes the host will read next
    inbound: VecDeque<u8>,
    /// Replies handed out one per write, before falling back to echo
    scripted: VecDeque<Vec<u8>>,
    /// Echo every write back followed by CR LF
    echo: bool,
    written: Vec<Vec<u8>>,
    fail_writes: bool,
    write_timeout_error: Option<io::ErrorKind>,
    reads: usize,
    closed: bool,
}

/// Mock serial port for testing
#[derive(Clone, Default)]
struct MockWire(Arc<Mutex<WireState>>);

impl MockWire {
    fn echo() -> Self {
        let wire = Self::default();
        wire.state().echo = true;
        wire
    }

    /// Answers the handshake, then only what the test scripts or injects
    fn scripted(replies: &[&str]) -> Self {
        let wire = Self::default();
        {
            let mut state = wire.state();
            state.scripted.push_back(b"TR265\r\n".to_vec());
            for r in replies {
                state.scripted.push_back(r.as_bytes().to_vec());
            }
        }
        wire
    }

    fn silent() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, WireState> {
        self.0.lock().unwrap()
    }

    fn inject(&self, bytes: &[u8]) {
        self.state().inbound.extend(bytes);
    }
}

impl Transport for MockWire {
    fn name(&self) -> &str {
        "mock"
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        state.reads += 1;
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        let n = state.inbound.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Serial write failed"));
        }
        state.written.push(data.to_vec());
        if let Some(reply) = state.scripted.pop_front() {
            state.inbound.extend(reply);
        } else if state.echo {
            state.inbound.extend(data.iter().copied());
            state.inbound.extend(b"\r\n".iter().copied());
        }
        Ok(())
    }

    fn set_write_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        match self.state().write_timeout_error {
            Some(kind) => Err(io::Error::new(kind, "write timeout")),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.state().closed = true;
        Ok(())
    }
}

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout_ms: 2000,
        poll_interval_ms: 1,
        idle_interval_ms: 1,
        ..ConnectionConfig::default()
    }
}

fn connect(wire: &MockWire) -> Connection {
    Connection::with_transport(Box::new(wire.clone()), fast_config(), None).unwrap()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn test_handshake_sends_command_and_keeps_reply() {
    let wire = MockWire::scripted(&[]);
    let conn = connect(&wire);
    assert_eq!(wire.state().written, vec![b"Z".to_vec()]);
    assert_eq!(conn.handshake_reply(), "TR265");
    assert!(conn.is_listening());
    assert_eq!(conn.name(), "mock");
}

#[test]
fn test_send_receive_returns_trimmed_payload() {
    let wire = MockWire::echo();
    let mut conn = connect(&wire);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let alphabet: Vec<char> = "ABCDEFGHIJ0123456789 ,.:-_".chars().collect();

    for _ in 0..100 {
        let len = rng.gen_range(0..40);
        let payload: String = (0..len)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect();
        let reply = conn.send_receive(&payload).unwrap();
        assert_eq!(reply, payload.trim());
    }
}

#[test]
fn test_send_does_not_append_terminator() {
    let wire = MockWire::scripted(&[]);
    let mut conn = connect(&wire);
    conn.send("T1").unwrap();
    conn.send(42).unwrap();
    let written = wire.state().written.clone();
    assert_eq!(written[1..].to_vec(), vec![b"T1".to_vec(), b"42".to_vec()]);
}

#[test]
fn test_stale_bytes_do_not_leak_into_next_transaction() {
    let wire = MockWire::scripted(&["ONE\r\nSTRAY", "TWO\r\n"]);
    let mut conn = connect(&wire);

    assert_eq!(conn.send_receive("1").unwrap(), "ONE");
    // Late bytes from the first exchange arrive before the second starts
    wire.inject(b"MORE STRAY\r\n");
    thread::sleep(Duration::from_millis(20));

    let second = conn.send_receive("2").unwrap();
    assert_eq!(second, "TWO");
}

#[test]
fn test_empty_reply_yields_empty_string() {
    let wire = MockWire::scripted(&["\r\n"]);
    let mut conn = connect(&wire);
    assert_eq!(conn.send_receive("").unwrap(), "");
}

#[test]
fn test_unknown_reply_raises_when_enabled() {
    let wire = MockWire::scripted(&["ERROR: UNKNOWN COMMAND\r\n"]);
    let mut conn = connect(&wire);
    assert!(conn.raise_errors());

    let err = conn.send_receive("Q9").unwrap_err();
    match &err {
        ProtocolError::Transaction { sent, source } => {
            assert_eq!(sent, "Q9");
            match source.as_ref() {
                ProtocolError::Device(payload) => assert_eq!(payload, "ERROR: UNKNOWN COMMAND"),
                other => panic!("expected device error, got {:?}", other),
            }
        }
        other => panic!("expected transaction error, got {:?}", other),
    }
    assert!(err.is_device_error());
}

#[test]
fn test_unknown_reply_returned_when_disabled() {
    let wire = MockWire::scripted(&["ERROR: UNKNOWN COMMAND\r\n"]);
    let mut conn = connect(&wire);
    conn.set_raise_errors(false);
    assert_eq!(conn.send_receive("Q9").unwrap(), "ERROR: UNKNOWN COMMAND");
}

#[test]
fn test_write_failure_is_wrapped_and_connection_survives() {
    let wire = MockWire::echo();
    let mut conn = connect(&wire);

    wire.state().fail_writes = true;
    let err = conn.send_receive("R").unwrap_err();
    match err {
        ProtocolError::Transaction { sent, source } => {
            assert_eq!(sent, "R");
            assert!(matches!(*source, ProtocolError::Write(_)));
        }
        other => panic!("expected transaction error, got {:?}", other),
    }

    wire.state().fail_writes = false;
    assert_eq!(conn.send_receive("R").unwrap(), "R");
}

#[test]
fn test_fragmented_replies_reassemble() {
    let reader = SimulatedReader::with_seed(7);
    let mut conn = Connection::with_transport(Box::new(reader), fast_config(), None).unwrap();

    for i in 0..200 {
        let reply = conn.send_receive(format!("ECHO tag-{:04}", i)).unwrap();
        assert_eq!(reply, format!("tag-{:04}", i));
    }
}

/// Reader that keeps a line noisy between replies and fragments every reply
#[derive(Clone)]
struct NoisyLine(Arc<Mutex<NoisyState>>);

struct NoisyState {
    /// Pieces of the reply in flight, delivered before any noise
    reply: VecDeque<Vec<u8>>,
    noise: VecDeque<Vec<u8>>,
    rng: StdRng,
}

impl NoisyLine {
    fn new(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(NoisyState {
            reply: VecDeque::new(),
            noise: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
        })))
    }

    /// Push whitespace chunks until `stop` is set
    fn feed(&self, stop: Arc<AtomicBool>) -> thread::JoinHandle<usize> {
        let line = self.clone();
        thread::spawn(move || {
            let mut fed = 0;
            while !stop.load(Ordering::Relaxed) {
                {
                    let mut state = line.0.lock().unwrap();
                    if state.noise.len() < 64 {
                        let chunk = if fed % 2 == 0 {
                            b" ".to_vec()
                        } else {
                            b"\t ".to_vec()
                        };
                        state.noise.push_back(chunk);
                        fed += 1;
                    }
                }
                thread::sleep(Duration::from_micros(200));
            }
            fed
        })
    }
}

impl Transport for NoisyLine {
    fn name(&self) -> &str {
        "noisy"
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.lock().unwrap();
        let chunk = match state.reply.pop_front() {
            Some(piece) => piece,
            None => match state.noise.pop_front() {
                Some(noise) => noise,
                None => return Ok(0),
            },
        };
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.0.lock().unwrap();
        let command = String::from_utf8_lossy(data).to_string();
        let body = command.strip_prefix("ECHO ").unwrap_or("TR265").as_bytes().to_vec();

        // Random cuts through the body, then CR and LF always land in
        // different chunks, with junk riding behind the LF
        let mut rest = &body[..];
        while !rest.is_empty() {
            let n = state.rng.gen_range(1..=rest.len().min(4));
            state.reply.push_back(rest[..n].to_vec());
            rest = &rest[n..];
        }
        match state.reply.back_mut() {
            Some(last) => last.push(b'\r'),
            None => state.reply.push_back(b"\r".to_vec()),
        }
        state.reply.push_back(b"\nJUNK".to_vec());
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_noisy_line_never_tears_replies() {
    let line = NoisyLine::new(0xfeed);
    let stop = Arc::new(AtomicBool::new(false));
    let feeder = line.feed(stop.clone());

    let mut conn =
        Connection::with_transport(Box::new(line.clone()), fast_config(), None).unwrap();
    assert_eq!(conn.handshake_reply(), "TR265");

    for i in 0..300 {
        let tag = format!("tag-{:04}-{}", i, "x".repeat(i % 9));
        assert_eq!(conn.send_receive(format!("ECHO {}", tag)).unwrap(), tag);
    }

    stop.store(true, Ordering::Relaxed);
    assert!(feeder.join().unwrap() > 0);
    conn.close().unwrap();
}

#[test]
fn test_unbounded_timeout_does_not_overflow() {
    let reader = SimulatedReader::with_seed(11);
    let mut conn = Connection::with_transport(Box::new(reader), fast_config(), None).unwrap();
    assert_eq!(conn.send_receive_timeout("V", Duration::MAX).unwrap(), "V1.0");

    conn.send("ECHO late").unwrap();
    assert_eq!(conn.receive_timeout(Duration::MAX).unwrap(), "late");
}

#[test]
fn test_huge_handshake_window_connects() {
    let config = ConnectionConfig {
        handshake_timeout_ms: u64::MAX,
        ..fast_config()
    };
    let conn = Connection::with_transport(Box::new(SimulatedReader::with_seed(12)), config, None)
        .unwrap();
    assert_eq!(conn.handshake_reply(), "TR265 SIMULATED V1.0");
}

#[test]
fn test_handshake_times_out_within_bound() {
    let wire = MockWire::silent();
    let config = ConnectionConfig {
        handshake_timeout_ms: 300,
        ..fast_config()
    };

    let start = Instant::now();
    let result = Connection::with_transport(Box::new(wire.clone()), config, None);
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(ProtocolError::Connect(_))));
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(1300), "took {:?}", elapsed);
    assert!(wire.state().closed);
}

#[test]
fn test_unexpected_write_timeout_error_fails_construction() {
    let wire = MockWire::echo();
    wire.state().write_timeout_error = Some(io::ErrorKind::PermissionDenied);
    let result = Connection::with_transport(Box::new(wire.clone()), fast_config(), None);
    assert!(matches!(result, Err(ProtocolError::Connect(_))));
    assert!(wire.state().closed);
}

#[test]
fn test_unsupported_write_timeout_is_tolerated() {
    let wire = MockWire::echo();
    wire.state().write_timeout_error = Some(io::ErrorKind::Unsupported);
    let mut conn = connect(&wire);
    assert_eq!(conn.send_receive("OK").unwrap(), "OK");
}

#[test]
fn test_receive_timeout_leaves_buffer_intact() {
    let wire = MockWire::scripted(&[]);
    let mut conn = connect(&wire);

    wire.inject(b"PART");
    let err = conn.receive_timeout(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout(_)));

    wire.inject(b"IAL\r\n");
    assert_eq!(conn.receive_timeout(Duration::from_secs(1)).unwrap(), "PARTIAL");
}

#[test]
fn test_receive_blocks_until_terminator() {
    let wire = MockWire::scripted(&[]);
    let mut conn = connect(&wire);

    let waiter = thread::spawn(move || {
        let reply = conn.receive();
        (conn, reply)
    });

    thread::sleep(Duration::from_millis(200));
    assert!(!waiter.is_finished());

    wire.inject(b"LATE\r\n");
    let (conn, reply) = waiter.join().unwrap();
    assert_eq!(reply.unwrap(), "LATE");
    conn.close().unwrap();
}

#[test]
fn test_observer_sees_every_chunk() {
    let wire = MockWire::echo();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let observer: ChunkObserver = Arc::new(move |chunk: &[u8]| {
        seen_clone.lock().unwrap().extend_from_slice(chunk);
    });

    let mut conn =
        Connection::with_transport(Box::new(wire.clone()), fast_config(), Some(observer)).unwrap();
    assert_eq!(conn.send_receive("PING").unwrap(), "PING");

    assert!(wait_for(|| seen.lock().unwrap().as_slice() == b"Z\r\nPING\r\n"));
}

#[test]
fn test_debug_com_does_not_change_results() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let wire = MockWire::echo();
    let mut conn = connect(&wire);
    conn.set_debug_com(true);
    assert!(conn.debug_com());
    assert_eq!(conn.send_receive(" traced ").unwrap(), "traced");
}

#[test]
fn test_close_stops_loop_and_closes_transport() {
    let wire = MockWire::echo();
    let conn = connect(&wire);

    let start = Instant::now();
    conn.close().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(wire.state().closed);

    let reads = wire.state().reads;
    thread::sleep(Duration::from_millis(30));
    assert_eq!(wire.state().reads, reads);
}

#[test]
fn test_drop_closes_transport() {
    let wire = MockWire::echo();
    {
        let _conn = connect(&wire);
    }
    assert!(wire.state().closed);
}
