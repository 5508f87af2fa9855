//! Reference counting for the channel's keep-alive handle

use crate::keepalive::KeepAliveHandle;

/// Keeps the channel handle referenced while sends are in flight
///
/// Counted references come from pending writes. An explicit
/// `pin(true|false)` from the user overrides the counter until the
/// channel is released.
#[derive(Debug)]
pub(crate) struct RefTracker {
    refs: usize,
    pinned: Option<bool>,
    handle: Option<KeepAliveHandle>,
}

impl RefTracker {
    pub(crate) fn new(handle: KeepAliveHandle) -> Self {
        Self {
            refs: 0,
            pinned: None,
            handle: Some(handle),
        }
    }

    pub(crate) fn ref_counted(&mut self) {
        self.refs += 1;
        if self.refs == 1 && self.pinned.is_none() {
            self.apply(true);
        }
    }

    pub(crate) fn unref_counted(&mut self) {
        if self.refs == 0 {
            return;
        }
        self.refs -= 1;
        if self.refs == 0 && self.pinned.is_none() {
            self.apply(false);
        }
    }

    pub(crate) fn pin(&mut self, referenced: bool) {
        self.pinned = Some(referenced);
        self.apply(referenced);
    }

    /// Unregister from the keep-alive registry for good
    pub(crate) fn release(&mut self) {
        self.handle = None;
    }

    pub(crate) fn count(&self) -> usize {
        self.refs
    }

    pub(crate) fn is_referenced(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, KeepAliveHandle::is_referenced)
    }

    fn apply(&mut self, referenced: bool) {
        if let Some(handle) = self.handle.as_mut() {
            handle.set_ref(referenced);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keepalive::KeepAlive;

    #[test]
    fn test_counted_refs_toggle_at_edges() {
        let registry = KeepAlive::new();
        let mut tracker = RefTracker::new(registry.handle(false));

        tracker.ref_counted();
        tracker.ref_counted();
        assert_eq!(registry.active(), 1);
        assert_eq!(tracker.count(), 2);

        tracker.unref_counted();
        assert!(tracker.is_referenced());

        tracker.unref_counted();
        assert!(!tracker.is_referenced());
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_unref_below_zero_is_ignored() {
        let registry = KeepAlive::new();
        let mut tracker = RefTracker::new(registry.handle(false));
        tracker.unref_counted();
        assert_eq!(tracker.count(), 0);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_explicit_pin_overrides_counter() {
        let registry = KeepAlive::new();
        let mut tracker = RefTracker::new(registry.handle(false));

        tracker.pin(false);
        tracker.ref_counted();
        assert!(!tracker.is_referenced());

        tracker.pin(true);
        tracker.unref_counted();
        assert!(tracker.is_referenced());
        assert_eq!(registry.active(), 1);
    }

    #[test]
    fn test_release_unregisters() {
        let registry = KeepAlive::new();
        let mut tracker = RefTracker::new(registry.handle(false));
        tracker.pin(true);
        assert_eq!(registry.active(), 1);

        tracker.release();
        assert_eq!(registry.active(), 0);
        tracker.pin(true);
        assert_eq!(registry.active(), 0);
    }
}
