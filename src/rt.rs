//! Tokio timer service for the GATT engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::trace;

use crate::gatt::{Timer, TimerId};

type Active = BTreeMap<TimerId, (u64, DropGuard)>;

/// [`Timer`] implementation that runs each timer as a Tokio task. Expired
/// timers are received from the paired [`TimerEvents`] and must be passed to
/// [`Gatt::on_timeout`](crate::gatt::Gatt::on_timeout). Dropping the service
/// cancels all running timers.
#[derive(Debug)]
pub struct TokioTimer {
    tx: mpsc::UnboundedSender<(TimerId, u64)>,
    active: Arc<Mutex<Active>>,
    gen: u64,
}

impl TokioTimer {
    /// Creates a timer service and its expiry receiver.
    #[must_use]
    pub fn new() -> (Self, TimerEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let active: Arc<Mutex<Active>> = Arc::default();
        let ev = TimerEvents {
            rx,
            active: Arc::downgrade(&active),
        };
        (Self { tx, active, gen: 0 }, ev)
    }

    /// Returns whether timer `id` is running.
    #[must_use]
    pub fn is_running(&self, id: TimerId) -> bool {
        self.active.lock().contains_key(&id)
    }
}

impl Timer for TokioTimer {
    /// Starts or restarts a timer.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    fn start(&mut self, id: TimerId, d: Duration) {
        self.gen = self.gen.wrapping_add(1);
        let (gen, c, tx) = (self.gen, CancellationToken::new(), self.tx.clone());
        trace!("Starting {id:?} for {d:?}");
        tokio::spawn(run(id, gen, d, c.clone(), tx));
        // Replacing the guard cancels the previous task
        self.active.lock().insert(id, (gen, c.drop_guard()));
    }

    fn stop(&mut self, id: TimerId) {
        if self.active.lock().remove(&id).is_some() {
            trace!("Stopped {id:?}");
        }
    }
}

/// Waits for the timer to expire and reports it unless cancelled.
async fn run(
    id: TimerId,
    gen: u64,
    d: Duration,
    c: CancellationToken,
    tx: mpsc::UnboundedSender<(TimerId, u64)>,
) {
    tokio::select! {
        _ = tokio::time::sleep(d) => {
            let _ = tx.send((id, gen));
        }
        _ = c.cancelled() => {}
    }
}

/// Receiver of expired timers.
#[derive(Debug)]
pub struct TimerEvents {
    rx: mpsc::UnboundedReceiver<(TimerId, u64)>,
    active: Weak<Mutex<Active>>,
}

impl TimerEvents {
    /// Returns the next expired timer or [`None`] once the timer service is
    /// dropped. Expiries of timers that were stopped or restarted after
    /// firing are skipped.
    pub async fn next(&mut self) -> Option<TimerId> {
        loop {
            let (id, gen) = self.rx.recv().await?;
            let Some(active) = self.active.upgrade() else {
                continue;
            };
            let mut active = active.lock();
            if matches!(active.get(&id), Some(&(g, _)) if g == gen) {
                active.remove(&id);
                return Some(id);
            }
            trace!("Ignored stale expiry of {id:?}");
        }
    }
}
