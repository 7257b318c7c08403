//! Cooperative shutdown for worker loops

use nix::sys::signal::{SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);

const SLICE: Duration = Duration::from_millis(100);

/// Set by SIGTERM/SIGINT (once installed) or by [`ShutdownFlag::trigger`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    local: Arc<AtomicBool>,
    watch_signals: bool,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGTERM and SIGINT to a thread that flips the process-wide flag.
    ///
    /// The signals are blocked in the calling thread and inherited by every
    /// thread spawned after it, so call this before any other thread starts.
    /// Later calls only return a new flag.
    pub fn install() -> std::io::Result<Self> {
        if !INSTALLED.swap(true, Ordering::SeqCst) {
            let mut signals = SigSet::empty();
            signals.add(Signal::SIGTERM);
            signals.add(Signal::SIGINT);
            if let Err(err) = signals.thread_block() {
                INSTALLED.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
            std::thread::Builder::new()
                .name("quarry-signals".into())
                .spawn(move || loop {
                    match signals.wait() {
                        Ok(signal) => {
                            tracing::info!(signal = signal.as_str(), "shutdown signal received");
                            SIGNALLED.store(true, Ordering::SeqCst);
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "waiting for signals failed");
                            break;
                        }
                    }
                })?;
        }
        Ok(Self {
            local: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        })
    }

    pub fn trigger(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.local.load(Ordering::SeqCst) || (self.watch_signals && SIGNALLED.load(Ordering::SeqCst))
    }

    /// Sleep up to `total` in short slices. Returns `false` if shutdown was
    /// requested meanwhile.
    pub fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_set() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}
