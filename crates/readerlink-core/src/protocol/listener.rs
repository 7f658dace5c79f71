//! Background receive loop
//!
//! Drains the transport into the [`ReceiveBuffer`] on a dedicated thread
//! until told to stop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{ReceiveBuffer, Transport};

/// Callback invoked with every chunk the loop receives
pub type ChunkObserver = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Transport shared between the loop and the caller
pub(crate) type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Loop tuning
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListenerSettings {
    pub chunk_size: usize,
    pub idle_interval: Duration,
}

/// Handle to a running receive loop
pub(crate) struct RxListener {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RxListener {
    /// Start the loop on a new thread
    pub(crate) fn spawn(
        transport: SharedTransport,
        buffer: Arc<ReceiveBuffer>,
        observer: Option<ChunkObserver>,
        settings: ListenerSettings,
    ) -> std::io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = stop_flag.clone();

        let handle = thread::Builder::new()
            .name("readerlink-rx".to_string())
            .spawn(move || {
                listen(&transport, &buffer, observer.as_ref(), settings, &stop_flag_clone)
            })?;

        Ok(Self {
            stop_flag,
            handle: Some(handle),
        })
    }

    /// True until the loop has been stopped
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("receive loop panicked");
            }
            tracing::debug!("receive loop stopped");
        }
    }
}

impl Drop for RxListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(
    transport: &Mutex<Box<dyn Transport>>,
    buffer: &ReceiveBuffer,
    observer: Option<&ChunkObserver>,
    settings: ListenerSettings,
    stop_flag: &AtomicBool,
) {
    let mut chunk = vec![0u8; settings.chunk_size.max(1)];

    while !stop_flag.load(Ordering::SeqCst) {
        let read = {
            let mut port = transport.lock().unwrap_or_else(PoisonError::into_inner);
            port.read_available(&mut chunk)
        };

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                // Some platforms report an empty port as an error
                tracing::trace!("read glitch treated as no data: {}", e);
                0
            }
        };

        if n == 0 {
            thread::sleep(settings.idle_interval);
            continue;
        }

        let data = &chunk[..n];
        buffer.append(data);

        if let Some(observer) = observer {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(data))).is_err() {
                tracing::warn!("chunk observer panicked; receive loop continues");
            }
        }
    }
}
