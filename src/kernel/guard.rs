use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reentrancy flag for check cycles. A trigger that finds the gate closed is
/// dropped, not queued.
#[derive(Debug, Default, Clone)]
pub struct CycleGate {
    busy: Arc<AtomicBool>,
}

impl CycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<CycleGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of one cycle. Dropping it (including while
/// unwinding from an error) reopens the gate.
#[derive(Debug)]
pub struct CycleGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_refused_until_guard_drops() {
        let gate = CycleGate::new();
        let guard = gate.try_enter();
        assert!(guard.is_some());
        assert!(gate.try_enter().is_none());
        assert!(gate.is_busy());
        drop(guard);
        assert!(!gate.is_busy());
        assert!(gate.try_enter().is_some());
    }
}
