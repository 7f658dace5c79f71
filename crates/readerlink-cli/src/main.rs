//! readerlink interactive terminal
//!
//! Connects to a reader, echoes everything it sends, and forwards typed
//! commands.
//!
//! Usage:
//!   readerlink [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port (default: config file, then auto-detect)
//!   --config PATH     JSON connection config
//!   --list            List serial ports and exit
//!   --demo            Talk to a simulated reader
//!   --debug-com       Log sent and received payloads
//!   --no-raise        Do not treat UNKNOWN replies as errors
//!
//! Every keystroke goes to the reader as it is typed, upper-cased; Enter
//! sends CR. `Q` or Ctrl-C quits.

use anyhow::{bail, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use readerlink_core::demo::SimulatedReader;
use readerlink_core::protocol::{list_ports, ChunkObserver, Connection, ConnectionConfig};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Options {
    port: Option<String>,
    config: Option<PathBuf>,
    list: bool,
    demo: bool,
    debug_com: bool,
    no_raise: bool,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut opts = Options::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                let port = args.get(i).context("--port needs a value")?;
                opts.port = Some(port.clone());
            }
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).context("--config needs a value")?;
                opts.config = Some(PathBuf::from(path));
            }
            "--list" | "-l" => opts.list = true,
            "--demo" => opts.demo = true,
            "--debug-com" => opts.debug_com = true,
            "--no-raise" => opts.no_raise = true,
            "--help" | "-h" => {
                println!("Usage: readerlink [--port PORT] [--config PATH] [--list] [--demo] [--debug-com] [--no-raise] [PORT]");
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option: {}", other),
            other => opts.port = Some(other.to_string()),
        }
        i += 1;
    }
    Ok(opts)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("readerlink").join("config.json"))
}

fn load_config(opts: &Options) -> Result<ConnectionConfig> {
    let mut config = match &opts.config {
        Some(path) => ConnectionConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => ConnectionConfig::from_json_file(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ConnectionConfig::default(),
        },
    };

    if let Some(port) = &opts.port {
        config.address = port.clone();
    }
    if opts.debug_com {
        config.debug_com = true;
    }
    if opts.no_raise {
        config.raise_errors = false;
    }
    Ok(config)
}

/// Echo raw reader traffic to the terminal
fn echo_observer() -> ChunkObserver {
    Arc::new(|chunk: &[u8]| {
        let mut out = io::stdout().lock();
        let _ = out.write_all(chunk);
        let _ = out.flush();
    })
}

/// What a keystroke means for the session
#[derive(Debug, PartialEq, Eq)]
enum KeyAction {
    Send(String),
    Quit,
    Ignore,
}

fn key_action(key: &KeyEvent) -> KeyAction {
    if key.kind != KeyEventKind::Press {
        return KeyAction::Ignore;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        KeyCode::Char('q') | KeyCode::Char('Q') => KeyAction::Quit,
        KeyCode::Char(c) => KeyAction::Send(c.to_uppercase().collect()),
        // Readers expect commands closed by CR
        KeyCode::Enter => KeyAction::Send("\r".to_string()),
        _ => KeyAction::Ignore,
    }
}

/// Raw terminal mode, restored on drop
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::warn!("failed to restore terminal: {}", e);
        }
    }
}

/// Forward keystrokes until the user quits. Replies arrive through the echo observer.
fn forward_keys(conn: &mut Connection) -> Result<()> {
    let _raw = RawMode::enable().context("switching terminal to raw mode")?;
    loop {
        let key = match event::read().context("reading keyboard")? {
            Event::Key(key) => key,
            _ => continue,
        };
        match key_action(&key) {
            KeyAction::Quit => return Ok(()),
            KeyAction::Send(text) => {
                if let Err(e) = conn.send(&text) {
                    tracing::error!("{}", e);
                }
            }
            KeyAction::Ignore => {}
        }
    }
}

fn open(opts: &Options, config: ConnectionConfig) -> Result<Connection> {
    let observer = Some(echo_observer());
    if opts.demo {
        return Connection::with_transport(Box::new(SimulatedReader::new()), config, observer)
            .context("starting simulated reader");
    }
    if config.address.is_empty() {
        return Connection::discover(&config, observer)
            .context("no reader found. Is the device plugged in?");
    }
    let address = config.address.clone();
    Connection::connect_with_observer(config, observer)
        .with_context(|| format!("no reader found on {}", address))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = parse_args(&args)?;

    if opts.list {
        for port in list_ports() {
            match &port.product {
                Some(product) => println!("{}\t{}", port.name, product),
                None => println!("{}", port.name),
            }
        }
        return Ok(());
    }

    let config = load_config(&opts)?;
    let mut conn = open(&opts, config)?;
    eprintln!("Device found on {}: {}", conn.name(), conn.handshake_reply());

    let forwarded = forward_keys(&mut conn);
    conn.close().context("closing connection")?;
    forwarded
}
