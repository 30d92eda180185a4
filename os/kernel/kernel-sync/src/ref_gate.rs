use core::{
    hint::spin_loop,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Set once the gate has been killed; no new live references after that.
const DEAD: usize = 1 << (usize::BITS - 1);
const COUNT_MASK: usize = !DEAD;

/// A reference count that can be switched into a draining mode.
///
/// The gate starts **live** holding one initial reference owned by whoever
/// created it. Users take additional references with
/// [`try_get_live`](Self::try_get_live) and drop them with [`put`](Self::put).
/// [`kill`](Self::kill) refuses all further live acquisitions and drops the
/// initial reference; once every outstanding reference is put back the gate
/// is **quiescent** and the guarded object may be torn down.
///
/// ```text
///   new() ──► live(n ≥ 1) ──kill()──► dead(n) ──put()…──► dead(0) = quiescent
///     ▲                                                          │
///     └──────────────────────────── reinit() ◄───────────────────┘
/// ```
///
/// Misuse (putting more than was taken, killing twice, reviving a gate that
/// still has references) is a bug in the caller and panics.
pub struct RefGate {
    state: AtomicUsize,
}

impl Default for RefGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RefGate {
    /// A live gate holding the initial reference.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(1),
        }
    }

    /// A gate that is already quiescent, ready for [`reinit`](Self::reinit).
    #[must_use]
    pub const fn new_quiescent() -> Self {
        Self {
            state: AtomicUsize::new(DEAD),
        }
    }

    /// Number of outstanding references, including the initial one while live.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    #[inline]
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state.load(Ordering::Acquire) & DEAD != 0
    }

    /// Dead and without references.
    #[inline]
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.state.load(Ordering::Acquire) == DEAD
    }

    /// Take a reference unconditionally.
    ///
    /// The caller must already hold one (so the count can not be zero); this
    /// succeeds even on a dead gate, which is what lets holders hand copies
    /// of their reference around during teardown.
    ///
    /// # Panics
    /// If the count is zero or would overflow.
    #[inline]
    pub fn get(&self) {
        self.get_many(1);
    }

    /// Take `n` references unconditionally. See [`get`](Self::get).
    ///
    /// # Panics
    /// If the count is zero or would overflow.
    pub fn get_many(&self, n: usize) {
        let prev = self.state.fetch_add(n, Ordering::Relaxed);
        let count = prev & COUNT_MASK;
        assert!(count != 0, "RefGate: get on a released gate");
        assert!(count.checked_add(n).is_some_and(|c| c <= COUNT_MASK), "RefGate: overflow");
    }

    /// Take a reference only while the gate is live.
    ///
    /// Never blocks. Returns `false` once [`kill`](Self::kill) has run.
    #[inline]
    pub fn try_get_live(&self) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            if s & DEAD != 0 || s & COUNT_MASK == 0 {
                return false;
            }
            match self
                .state
                .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
    }

    /// Drop one reference.
    ///
    /// Returns `true` if this was the last reference of a dead gate, i.e. the
    /// caller observed the transition to quiescence.
    ///
    /// # Panics
    /// On underflow (putting a reference that was never taken).
    #[inline]
    pub fn put(&self) -> bool {
        self.put_many(1)
    }

    /// Drop `n` references. See [`put`](Self::put).
    ///
    /// # Panics
    /// On underflow.
    pub fn put_many(&self, n: usize) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            assert!(s & COUNT_MASK >= n, "RefGate: reference count underflow");
            match self
                .state
                .compare_exchange_weak(s, s - n, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return s - n == DEAD,
                Err(cur) => s = cur,
            }
        }
    }

    /// Refuse further live acquisitions and drop the initial reference.
    ///
    /// Returns `true` if the gate became quiescent right away.
    ///
    /// # Panics
    /// If the gate was already killed.
    pub fn kill(&self) -> bool {
        let Some(quiescent) = self.try_kill() else {
            panic!("RefGate: killed twice");
        };
        quiescent
    }

    /// [`kill`](Self::kill) for callers racing to tear the same object down.
    ///
    /// Exactly one caller gets `Some`, carrying what `kill` would have
    /// returned; everyone else, and any call on an already dead gate, gets
    /// `None` and leaves the count alone.
    pub fn try_kill(&self) -> Option<bool> {
        let prev = self.state.fetch_or(DEAD, Ordering::AcqRel);
        if prev & DEAD != 0 {
            return None;
        }
        Some(self.put())
    }

    /// Spin until every outstanding reference has been put.
    ///
    /// Only meaningful after [`kill`](Self::kill); on a live gate this would
    /// wait forever for the initial reference, so that is rejected.
    ///
    /// # Panics
    /// If the gate is still live.
    pub fn wait_for_quiescence(&self) {
        assert!(self.is_dead(), "RefGate: waiting on a live gate");
        while !self.is_quiescent() {
            spin_loop();
        }
    }

    /// Bring a quiescent gate back to live with a fresh initial reference.
    ///
    /// # Panics
    /// If the gate is live or still has references.
    pub fn reinit(&self) {
        let ok = self
            .state
            .compare_exchange(DEAD, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        assert!(ok, "RefGate: reinit of a gate in use");
    }
}

impl core::fmt::Debug for RefGate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = self.state.load(Ordering::Relaxed);
        f.debug_struct("RefGate")
            .field("dead", &(s & DEAD != 0))
            .field("count", &(s & COUNT_MASK))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_live_with_one_reference() {
        let g = RefGate::new();
        assert_eq!(g.count(), 1);
        assert!(!g.is_dead());
        assert!(!g.is_quiescent());
    }

    #[test]
    fn kill_without_users_is_immediately_quiescent() {
        let g = RefGate::new();
        assert!(g.kill());
        assert!(g.is_quiescent());
    }

    #[test]
    fn dead_gate_refuses_live_gets_but_accepts_puts() {
        let g = RefGate::new();
        assert!(g.try_get_live());
        assert!(!g.kill());
        assert!(!g.try_get_live());
        assert_eq!(g.count(), 1);
        assert!(g.put());
        assert!(g.is_quiescent());
    }

    #[test]
    fn only_the_first_try_kill_wins() {
        let g = RefGate::new();
        g.get();
        assert_eq!(g.try_kill(), Some(false));
        assert_eq!(g.try_kill(), None);
        assert_eq!(g.count(), 1);
        assert!(g.put());
        assert_eq!(g.try_kill(), None);
        assert!(g.is_quiescent());

        assert_eq!(RefGate::new_quiescent().try_kill(), None);
    }

    #[test]
    fn reinit_revives_a_quiescent_gate() {
        let g = RefGate::new_quiescent();
        assert!(!g.try_get_live());
        g.reinit();
        assert!(g.try_get_live());
        assert_eq!(g.count(), 2);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn put_without_get_panics() {
        let g = RefGate::new();
        g.kill();
        g.put();
    }

    #[test]
    #[should_panic(expected = "killed twice")]
    fn double_kill_panics() {
        let g = RefGate::new();
        g.get();
        g.kill();
        g.kill();
    }

    #[test]
    #[should_panic(expected = "in use")]
    fn reinit_with_references_panics() {
        let g = RefGate::new();
        g.reinit();
    }
}
