//! Pool-wide busy/idle tracking
//!
//! Workers in a pool share one [`IdleMonitor`]. It only feeds the
//! disconnect-after-idle decision: a worker whose own idle timeout has
//! elapsed disconnects only when no worker in the pool is busy.

use parking_lot::Mutex;

#[derive(Debug)]
struct IdleState {
    busy: usize,
    total: usize,
}

/// Counter of busy workers, linearized by its own lock
#[derive(Debug)]
pub struct IdleMonitor {
    state: Mutex<IdleState>,
}

impl IdleMonitor {
    /// Create a monitor for a pool of `total` workers
    pub fn new(total: usize) -> Self {
        Self {
            state: Mutex::new(IdleState { busy: 0, total }),
        }
    }

    /// A worker started a job
    pub fn mark_busy(&self) {
        let mut state = self.state.lock();
        state.busy += 1;
    }

    /// A worker finished a job
    ///
    /// Unmatched calls are ignored so the counter never underflows.
    pub fn mark_idle(&self) {
        let mut state = self.state.lock();
        state.busy = state.busy.saturating_sub(1);
    }

    /// True iff no worker is busy
    pub fn is_idle(&self) -> bool {
        self.state.lock().busy == 0
    }

    pub fn busy_count(&self) -> usize {
        self.state.lock().busy
    }

    /// Number of workers the monitor was built for
    pub fn total(&self) -> usize {
        self.state.lock().total
    }
}

impl Default for IdleMonitor {
    fn default() -> Self {
        Self::new(1)
    }
}
