use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Armed,
    Stopped,
}

/// Holds notification sources back until every source is registered.
#[derive(Debug)]
pub struct StartupBarrier {
    phase: Mutex<Phase>,
    changed: Condvar,
}

impl Default for StartupBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupBarrier {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Starting),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        *self.lock()
    }

    /// Releases the waiters. A stopped barrier stays stopped.
    pub fn arm(&self) {
        let mut phase = self.lock();
        if *phase == Phase::Starting {
            *phase = Phase::Armed;
            self.changed.notify_all();
        }
    }

    /// Returns the previous phase.
    pub fn stop(&self) -> Phase {
        let previous = std::mem::replace(&mut *self.lock(), Phase::Stopped);
        self.changed.notify_all();
        previous
    }

    /// Blocks while starting. Returns whether notifications may flow.
    pub fn wait(&self) -> bool {
        let phase = self
            .changed
            .wait_while(self.lock(), |phase| *phase == Phase::Starting)
            .unwrap_or_else(PoisonError::into_inner);
        *phase == Phase::Armed
    }
}
