use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raised while a remote change is applied so the host's broadcast path can
/// drop the echo. Clones share one flag, not one per thread: only sound when
/// every apply and every host broadcast runs on the thread driving the pump.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyGuard {
    flag: Arc<AtomicBool>,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Raises the flag until the returned token is dropped. The previous value
    /// is restored on drop, including during unwinding.
    pub fn enter(&self) -> GuardToken {
        let previous = self.flag.swap(true, Ordering::AcqRel);
        GuardToken {
            flag: Arc::clone(&self.flag),
            previous,
        }
    }

    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _token = self.enter();
        f()
    }
}

#[must_use = "the guard is released as soon as the token is dropped"]
#[derive(Debug)]
pub struct GuardToken {
    flag: Arc<AtomicBool>,
    previous: bool,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::Release);
    }
}

/// Identifiers the host allocated during one local operation, in allocation
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedIds {
    pub array16: Vec<u16>,
    pub array32: Vec<u32>,
}

impl CollectedIds {
    pub fn is_empty(&self) -> bool {
        self.array16.is_empty() && self.array32.is_empty()
    }
}

/// Passed into a locally-authored host operation to record the ids it
/// allocates, so they can ship alongside the resulting command.
#[derive(Debug, Default)]
pub struct IdCollector {
    ids: CollectedIds,
}

impl IdCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_u16(&mut self, id: u16) {
        self.ids.array16.push(id);
    }

    pub fn record_u32(&mut self, id: u32) {
        self.ids.array32.push(id);
    }

    pub fn finish(self) -> CollectedIds {
        self.ids
    }
}

/// Passed into a remote apply so the host consumes exactly the ids the
/// originating peer allocated, in the same order.
#[derive(Debug, Default)]
pub struct IdReplay {
    array16: VecDeque<u16>,
    array32: VecDeque<u32>,
}

impl IdReplay {
    pub fn new(array16: Vec<u16>, array32: Vec<u32>) -> Self {
        Self {
            array16: array16.into(),
            array32: array32.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        self.array16.pop_front()
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        self.array32.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.array16.len() + self.array32.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

impl From<CollectedIds> for IdReplay {
    fn from(ids: CollectedIds) -> Self {
        Self::new(ids.array16, ids.array32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_released_on_drop() {
        let guard = ReentrancyGuard::new();
        assert!(!guard.is_set());
        {
            let _token = guard.enter();
            assert!(guard.is_set());
        }
        assert!(!guard.is_set());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let guard = ReentrancyGuard::new();
        let inner = guard.clone();

        let result = std::panic::catch_unwind(move || {
            inner.run(|| panic!("host blew up"));
        });

        assert!(result.is_err());
        assert!(!guard.is_set());
    }

    #[test]
    fn test_nested_enter_restores_outer() {
        let guard = ReentrancyGuard::new();
        let outer = guard.enter();
        {
            let _inner = guard.enter();
            assert!(guard.is_set());
        }
        assert!(guard.is_set());
        drop(outer);
        assert!(!guard.is_set());
    }

    #[test]
    fn test_clones_share_flag() {
        let guard = ReentrancyGuard::new();
        let observer = guard.clone();
        guard.run(|| assert!(observer.is_set()));
        assert!(!observer.is_set());
    }

    #[test]
    fn test_collected_ids_replay_in_order() {
        let mut collector = IdCollector::new();
        collector.record_u16(4);
        collector.record_u32(100_000);
        collector.record_u16(9);

        let ids = collector.finish();
        assert_eq!(ids.array16, vec![4, 9]);
        assert_eq!(ids.array32, vec![100_000]);

        let mut replay = IdReplay::from(ids);
        assert_eq!(replay.remaining(), 3);
        assert_eq!(replay.next_u16(), Some(4));
        assert_eq!(replay.next_u16(), Some(9));
        assert_eq!(replay.next_u16(), None);
        assert_eq!(replay.next_u32(), Some(100_000));
        assert!(replay.is_exhausted());
    }
}
