//! Scoped suspension of snapshot/checkpoint participation.
//!
//! The read path must not have its side effects captured as event-processing
//! state, so `find` suspends state storage for the duration of the call. The
//! flag is thread-scoped and restored by an RAII guard, so it survives early
//! returns and panics alike.

use std::cell::Cell;

thread_local! {
    static SKIP_STATE_STORAGE: Cell<bool> = const { Cell::new(false) };
}

/// Access point for the state-storage skip flag consumed by the snapshot
/// collaborator.
pub struct SnapshotService;

impl SnapshotService {
    /// Suspend state storage on the current thread until the returned guard
    /// drops. Nested guards restore the previous value.
    pub fn skip_state_guard() -> SkipStateGuard {
        let previous = SKIP_STATE_STORAGE.with(|flag| flag.replace(true));
        SkipStateGuard { previous }
    }

    /// Whether state storage is currently suspended on this thread
    pub fn is_state_storage_skipped() -> bool {
        SKIP_STATE_STORAGE.with(|flag| flag.get())
    }
}

/// RAII guard restoring the state-storage flag on drop
pub struct SkipStateGuard {
    previous: bool,
}

impl Drop for SkipStateGuard {
    fn drop(&mut self) {
        SKIP_STATE_STORAGE.with(|flag| flag.set(self.previous));
    }
}
