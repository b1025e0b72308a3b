//! Timeouts for blocking calls into external collaborators.
//!
//! A call that misses its deadline keeps running on its detached worker.
//! [`CallGate`] counts those workers until they actually return, so a
//! caller that times out cannot push more calls at a collaborator than the
//! gate allows.

use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeadlineError {
    #[error("call did not finish within {0:?}")]
    Elapsed(Duration),

    #[error("worker thread panicked")]
    Panicked,
}

/// Bounds the number of calls in flight, including ones whose caller has
/// already given up on them.
#[derive(Debug)]
pub struct CallGate {
    capacity: usize,
    in_flight: Mutex<usize>,
    freed: Condvar,
}

/// Held by a worker for as long as its call runs.
struct Permit(Arc<CallGate>);

impl Drop for Permit {
    fn drop(&mut self) {
        let mut in_flight = self.0.lock();
        *in_flight = in_flight.saturating_sub(1);
        drop(in_flight);
        self.0.freed.notify_one();
    }
}

impl CallGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            in_flight: Mutex::new(0),
            freed: Condvar::new(),
        })
    }

    pub fn in_flight(&self) -> usize {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until `deadline` for a free slot.
    fn acquire(self: &Arc<Self>, deadline: Instant) -> Option<Permit> {
        let mut in_flight = self.lock();
        while *in_flight >= self.capacity {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self
                .freed
                .wait_timeout(in_flight, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            in_flight = guard;
        }
        *in_flight += 1;
        Some(Permit(self.clone()))
    }
}

/// Run `f` on a worker thread and wait at most `timeout` for its result.
///
/// On timeout the worker is detached and its result discarded when it
/// eventually finishes.
pub fn run_with_deadline<T, F>(timeout: Duration, f: F) -> Result<T, DeadlineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    receive(&rx, timeout, timeout)
}

/// Like [`run_with_deadline`], but only starts `f` once `gate` has a free
/// slot. Waiting for the slot counts against `timeout`, and the slot stays
/// taken until `f` returns, even if the caller has timed out by then.
pub fn run_gated<T, F>(gate: &Arc<CallGate>, timeout: Duration, f: F) -> Result<T, DeadlineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let deadline = Instant::now() + timeout;
    let permit = gate.acquire(deadline).ok_or(DeadlineError::Elapsed(timeout))?;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _permit = permit;
        let _ = tx.send(f());
    });

    let remaining = deadline.saturating_duration_since(Instant::now());
    receive(&rx, remaining, timeout)
}

fn receive<T>(rx: &mpsc::Receiver<T>, wait: Duration, timeout: Duration) -> Result<T, DeadlineError> {
    match rx.recv_timeout(wait) {
        Ok(value) => Ok(value),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(DeadlineError::Elapsed(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(DeadlineError::Panicked),
    }
}
