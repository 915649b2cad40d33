//! Exactly-once termination latch.
//!
//! The backend's monitor resolves it once; every waiter sees the same reason.

use crate::config::types::TerminationReason;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct TerminationLatch {
    slot: Mutex<Option<TerminationReason>>,
    resolved: Condvar,
}

impl TerminationLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<TerminationReason>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if the latch had already been resolved.
    pub fn resolve(&self, reason: TerminationReason) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        self.resolved.notify_all();
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().is_some()
    }

    pub fn wait(&self) -> TerminationReason {
        let mut slot = self.lock();
        loop {
            if let Some(reason) = slot.as_ref() {
                return reason.clone();
            }
            slot = self
                .resolved
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TerminationReason> {
        let slot = self.lock();
        let (slot, _) = self
            .resolved
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_resolution_wins() {
        let latch = TerminationLatch::new();
        assert!(latch.resolve(TerminationReason::Timeout));
        assert!(!latch.resolve(TerminationReason::ForcedExit));
        assert_eq!(latch.wait(), TerminationReason::Timeout);
    }

    #[test]
    fn test_wait_wakes_on_resolution() {
        let latch = Arc::new(TerminationLatch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        thread::sleep(Duration::from_millis(20));
        latch.resolve(TerminationReason::Exited { code: 3 });
        assert_eq!(waiter.join().unwrap(), TerminationReason::Exited { code: 3 });
    }

    #[test]
    fn test_wait_timeout_unresolved() {
        let latch = TerminationLatch::new();
        assert_eq!(latch.wait_timeout(Duration::from_millis(5)), None);
        assert!(!latch.is_resolved());
    }
}
