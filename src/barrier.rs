use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

/// Counted barrier for checkpoint rendezvous. The GC thread resets it to
/// zero, arms N closures, and waits for N passes; each closure's run ends
/// with a pass, whether the mutator or the GC ran it.
pub struct GcBarrier {
    count: Mutex<usize>,
    condition: Condvar,
}

impl GcBarrier {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condition: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        *self.count.lock() = 0;
    }

    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.condition.notify_all();
    }

    /// Block until `target` passes have been recorded since the last reset.
    /// Checkpoints are short, so spin briefly before parking.
    pub fn wait_for(&self, target: usize) {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if *self.count.lock() >= target {
                return;
            }
            backoff.snooze();
        }
        let mut count = self.count.lock();
        while *count < target {
            self.condition.wait(&mut count);
        }
    }
}

impl Default for GcBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn waits_for_all_passes() {
        let barrier = Arc::new(GcBarrier::new());
        barrier.reset();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || barrier.pass()));
        }
        barrier.wait_for(4);
        for h in handles {
            h.join().unwrap();
        }
    }
}
