use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use linepipe_frame::FrameReader;
use linepipe_transport::ReadTimeout;
use tracing::{debug, trace, warn};

use crate::config::{DeliveryCallback, ErrorCallback};
use crate::error::{ChannelError, Result};

/// Periodic inbound reader for one channel.
///
/// A single worker thread owns the frame reader and runs every tick, so two
/// ticks of the same poller never overlap and the callback is never entered
/// re-entrantly. A tick that outlasts the interval pushes the schedule back;
/// missed ticks are dropped rather than queued.
pub struct Poller {
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Poller {
    /// Start polling `reader` every `interval`.
    ///
    /// Each tick makes one [`FrameReader::try_read_frame`] attempt and, on
    /// success, calls `callback` with the payload lines before the tick ends.
    /// Any read error ends the loop; it is passed to `on_error` and returned
    /// from [`Poller::join`].
    pub fn start<T>(
        reader: FrameReader<T>,
        interval: Duration,
        callback: DeliveryCallback,
        on_error: Option<ErrorCallback>,
    ) -> Result<Self>
    where
        T: Read + ReadTimeout + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = mpsc::channel();

        let worker = Worker {
            reader,
            interval,
            callback,
            running: Arc::clone(&running),
            frames: Arc::clone(&frames),
            stop_rx,
        };

        // Events from the worker land in whatever span the owner started it in.
        let span = tracing::Span::current();
        let handle = std::thread::Builder::new()
            .name("linepipe-poller".to_string())
            .spawn(move || {
                let _entered = span.enter();
                let outcome = worker.run();
                if let (Err(err), Some(on_error)) = (&outcome, &on_error) {
                    on_error(err);
                }
                outcome
            })?;

        debug!(?interval, "poller started");

        Ok(Self {
            running,
            frames,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Halt future ticks. A tick in progress finishes first. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("poller stop requested");
        }
        // The worker may already be gone; nothing to wake then.
        let _ = self.stop_tx.send(());
    }

    /// Whether the worker is still ticking.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Number of frames delivered to the callback so far.
    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Wait for the worker to exit and return how the loop ended.
    ///
    /// Does not stop the poller; call [`Poller::stop`] first to end it.
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ChannelError::WorkerPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Detach: the worker notices on its next wake-up.
        self.stop();
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("running", &self.is_running())
            .field("frames_delivered", &self.frames_delivered())
            .finish()
    }
}

struct Worker<T> {
    reader: FrameReader<T>,
    interval: Duration,
    callback: DeliveryCallback,
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    stop_rx: mpsc::Receiver<()>,
}

impl<T: Read + ReadTimeout> Worker<T> {
    fn run(mut self) -> Result<()> {
        let outcome = self.tick_loop();
        self.running.store(false, Ordering::SeqCst);
        match &outcome {
            Ok(()) => debug!(frames = self.frames.load(Ordering::SeqCst), "poller stopped"),
            Err(err) => warn!(error = %err, "poller stopped on error"),
        }
        outcome
    }

    fn tick_loop(&mut self) -> Result<()> {
        let mut next_tick = Instant::now();
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match self.stop_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }

            self.tick()?;

            next_tick += self.interval;
            let now = Instant::now();
            if next_tick < now {
                trace!(overrun = ?(now - next_tick), "tick overran interval; skipping missed ticks");
                next_tick = now + self.interval;
            }
        }
    }

    fn tick(&mut self) -> Result<()> {
        let Some(frame) = self.reader.try_read_frame()? else {
            return Ok(());
        };

        let count = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(frame = count, lines = frame.len(), "delivering frame");

        let callback = &self.callback;
        let lines = frame.into_lines();
        catch_unwind(AssertUnwindSafe(|| callback(lines)))
            .map_err(|_| ChannelError::CallbackPanicked)
    }
}
