//! Shutdown comes in two strengths.  A *soft* shutdown stops the
//! receiver from accepting new connections, but keeps serving the
//! ones already open.  A *hard* shutdown stops everything: the
//! receive loop exits, and every worker blocked on its queue wakes up
//! empty-handed.
//!
//! Requesting either kind only stores to an atomic, so it is safe to
//! do from a signal handler.  Waking blocked workers is a separate
//! step (see [`crate::workload_queue::WorkloadQueue::wake`]) that
//! must happen in regular thread context.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

#[derive(Debug, Default)]
pub struct Shutdown {
    soft: AtomicBool,
    hard: AtomicBool,
}

impl Shutdown {
    pub const fn new() -> Shutdown {
        Shutdown {
            soft: AtomicBool::new(false),
            hard: AtomicBool::new(false),
        }
    }

    /// Stops accepting new connections.
    pub fn request_soft(&self) {
        self.soft.store(true, Ordering::SeqCst);
    }

    /// Stops everything.  A hard shutdown implies a soft one.
    pub fn request_hard(&self) {
        self.soft.store(true, Ordering::SeqCst);
        self.hard.store(true, Ordering::SeqCst);
    }

    pub fn is_soft(&self) -> bool {
        self.soft.load(Ordering::SeqCst)
    }

    pub fn is_hard(&self) -> bool {
        self.hard.load(Ordering::SeqCst)
    }
}

#[test]
fn test_soft_then_hard() {
    let shutdown = Shutdown::new();
    assert!(!shutdown.is_soft());
    assert!(!shutdown.is_hard());

    shutdown.request_soft();
    assert!(shutdown.is_soft());
    assert!(!shutdown.is_hard());

    shutdown.request_hard();
    assert!(shutdown.is_soft());
    assert!(shutdown.is_hard());
}

#[test]
fn test_hard_implies_soft() {
    let shutdown = Shutdown::default();

    shutdown.request_hard();
    assert!(shutdown.is_soft());
}
