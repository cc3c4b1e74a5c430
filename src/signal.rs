use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Two-bit handoff between the driver thread and a worker thread.
///
/// `raised` means a request is pending for the worker, `finished` means the
/// worker is done and the driver has not acknowledged it yet. The driver
/// writes `raised` (and clears `finished`), the worker writes `finished`
/// (and clears `raised`).
#[derive(Debug, Default)]
pub struct Signal {
    raised: AtomicBool,
    finished: AtomicBool,
    gate: Mutex<()>,
    done: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when a request of this kind was already outstanding.
    pub fn raise(&self) -> bool {
        !self.raised.swap(true, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Raised or finished-but-unacknowledged.
    pub fn is_engaged(&self) -> bool {
        self.is_raised() || self.is_finished()
    }

    pub fn mark_finished(&self) {
        // finished goes up before raised goes down, so `is_engaged` never
        // observes an idle gap.
        self.finished.store(true, Ordering::Release);
        self.raised.store(false, Ordering::Release);

        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.done.notify_all();
    }

    /// Returns `true` when there was a finished bit to clear.
    pub fn acknowledge(&self) -> bool {
        self.finished.swap(false, Ordering::AcqRel)
    }

    pub fn hard_reset(&self) {
        self.raised.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);

        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.done.notify_all();
    }

    /// Blocks the calling thread until the worker marks the request finished
    /// or the signal is reset.
    pub fn wait_finished(&self) {
        let guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .done
            .wait_while(guard, |_| self.is_raised() && !self.is_finished())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`Signal::wait_finished`], giving up after `timeout`. Returns
    /// `true` when the request is no longer outstanding.
    pub fn wait_finished_timeout(&self, timeout: Duration) -> bool {
        let guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let (_guard, result) = self
            .done
            .wait_timeout_while(guard, timeout, |_| self.is_raised() && !self.is_finished())
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }
}
