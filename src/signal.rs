use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// A one-shot readiness latch.
///
/// `pulse` is idempotent; `wait` suspends the caller until the latch has
/// been pulsed. Latches are never reset.
#[derive(Default)]
pub struct OneShot {
    pulsed: Mutex<bool>,
    cv: Condvar,
}

impl OneShot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pulse(&self) {
        let mut pulsed = self.pulsed.lock();
        if !*pulsed {
            *pulsed = true;
            self.cv.notify_all();
        }
    }

    #[must_use]
    pub fn is_pulsed(&self) -> bool {
        *self.pulsed.lock()
    }

    pub fn wait(&self) {
        let mut pulsed = self.pulsed.lock();
        while !*pulsed {
            self.cv.wait(&mut pulsed);
        }
    }
}

impl std::fmt::Debug for OneShot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShot")
            .field("pulsed", &self.is_pulsed())
            .finish()
    }
}

/// Process-wide drain flag checked by long-running sweeps.
#[derive(Default)]
pub(crate) struct DrainSignal {
    draining: AtomicBool,
}

impl DrainSignal {
    pub fn signal(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

/// Counts in-flight background work so shutdown can wait for it.
#[derive(Default)]
pub(crate) struct Drainer {
    active: Mutex<usize>,
    cv: Condvar,
}

impl Drainer {
    pub fn enter(&self) {
        *self.active.lock() += 1;
    }

    pub fn exit(&self) {
        let mut active = self.active.lock();
        debug_assert!(*active > 0);
        *active -= 1;
        if *active == 0 {
            self.cv.notify_all();
        }
    }

    pub fn wait_idle(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.cv.wait(&mut active);
        }
    }
}
