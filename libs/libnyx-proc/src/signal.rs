//! Boundary with the signal-delivery subsystem
//!
//! The core never looks at how a native exit is observed. It hands the
//! subsystem a [`Termination`] per spawned child and relies on two things:
//! the flag flips exactly once, and the counting notification goes up by
//! exactly one at the same time. [`LocalSignals`] is an in-process
//! implementation that watches host children from helper threads.

use std::num::NonZeroU64;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

use crate::table::Pid;

/// Opaque handle other instances use to deliver signals to a process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SigWrite(NonZeroU64);

impl SigWrite {
    /// Wrap a raw handle; 0 means "no handle"
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw handle value
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

/// Outcome of a blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The awaited object became ready
    Signaled,
    /// An asynchronous signal arrived for the caller first
    Interrupted,
}

/// Termination state of one child, shared with whoever observes its exit
#[derive(Debug, Default)]
pub struct Termination {
    claimed: AtomicBool,
    terminated: AtomicBool,
    exit_code: AtomicI32,
}

impl Termination {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the native exit. Returns false if it was already recorded.
    pub fn mark_exited(&self, exit_code: i32) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.exit_code.store(exit_code, Ordering::Relaxed);
        self.terminated.store(true, Ordering::Release);
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Native exit code, once terminated
    pub fn exit_code(&self) -> Option<i32> {
        self.is_terminated()
            .then(|| self.exit_code.load(Ordering::Relaxed))
    }
}

/// A child as announced to the signal subsystem
#[derive(Debug, Clone)]
pub struct ChildRegistration {
    pub pid: Pid,
    pub native_pid: u32,
    pub termination: Arc<Termination>,
}

/// What the core needs from the signal-delivery subsystem
pub trait SignalSubsystem: Send + Sync {
    /// Delivery handle for the calling process, published in its table slot
    fn process_sigwrite(&self) -> Option<SigWrite>;

    /// Start observing a freshly spawned child
    fn register_child(&self, child: &ChildRegistration);

    /// Block until `termination` is set or a signal interrupts the caller.
    /// Consumes nothing.
    fn wait_child(&self, termination: &Termination) -> WaitResult;

    /// Block until one child-terminated notification is available and
    /// consume it, or return `Interrupted` without consuming anything.
    fn wait_notification(&self) -> WaitResult;

    /// Consume one notification, blocking until one is available.
    /// Never interrupted.
    fn consume_notification(&self);
}

#[derive(Debug, Default)]
struct NotifyState {
    notifications: u64,
    interrupt_pending: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<NotifyState>,
    cond: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, NotifyState> {
        // A panicking watcher cannot leave the counter half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, NotifyState>) -> MutexGuard<'a, NotifyState> {
        self.cond
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process signal subsystem: a counting notification plus an
/// interrupt flag, guarded by one mutex so no wakeup is lost.
#[derive(Debug, Clone, Default)]
pub struct LocalSignals {
    shared: Arc<Shared>,
    sigwrite: Option<SigWrite>,
}

impl LocalSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `sigwrite` as this process's delivery handle
    pub fn with_sigwrite(mut self, sigwrite: SigWrite) -> Self {
        self.sigwrite = Some(sigwrite);
        self
    }

    /// Record a native exit: flip the flag and post one notification
    pub fn notify_exit(&self, termination: &Termination, exit_code: i32) {
        let mut state = self.shared.state();
        if termination.mark_exited(exit_code) {
            state.notifications += 1;
            self.shared.cond.notify_all();
        } else {
            warn!("Duplicate exit notification ignored");
        }
    }

    /// Simulate an asynchronous signal arriving for the caller
    pub fn interrupt(&self) {
        let mut state = self.shared.state();
        state.interrupt_pending = true;
        self.shared.cond.notify_all();
    }

    /// Notifications posted but not yet consumed
    pub fn pending_notifications(&self) -> u64 {
        self.shared.state().notifications
    }

    /// Watch a host child from a helper thread, notifying when it exits
    pub fn watch_native(&self, mut child: Child, termination: Arc<Termination>) -> JoinHandle<()> {
        let signals = self.clone();
        thread::spawn(move || {
            let native_pid = child.id();
            let code = match child.wait() {
                Ok(status) => status.code().unwrap_or_else(|| {
                    use std::os::unix::process::ExitStatusExt;
                    128 + status.signal().unwrap_or(0)
                }),
                Err(e) => {
                    warn!("wait on native pid {} failed: {}", native_pid, e);
                    -1
                }
            };
            debug!("Native pid {} exited with {}", native_pid, code);
            signals.notify_exit(&termination, code);
        })
    }
}

/// Wait for a watcher started by [`LocalSignals::watch_native`].
/// Returns false, after logging, if the watcher panicked.
pub fn join_watcher(watcher: JoinHandle<()>, native_pid: u32) -> bool {
    match watcher.join() {
        Ok(()) => true,
        Err(_) => {
            error!("Watcher for native pid {} panicked", native_pid);
            false
        }
    }
}

impl SignalSubsystem for LocalSignals {
    fn process_sigwrite(&self) -> Option<SigWrite> {
        self.sigwrite
    }

    fn register_child(&self, child: &ChildRegistration) {
        debug!("Observing child {} (native pid {})", child.pid, child.native_pid);
    }

    fn wait_child(&self, termination: &Termination) -> WaitResult {
        let mut state = self.shared.state();
        loop {
            if termination.is_terminated() {
                return WaitResult::Signaled;
            }
            if state.interrupt_pending {
                state.interrupt_pending = false;
                return WaitResult::Interrupted;
            }
            state = self.shared.wait(state);
        }
    }

    fn wait_notification(&self) -> WaitResult {
        let mut state = self.shared.state();
        loop {
            if state.notifications > 0 {
                state.notifications -= 1;
                return WaitResult::Signaled;
            }
            if state.interrupt_pending {
                state.interrupt_pending = false;
                return WaitResult::Interrupted;
            }
            state = self.shared.wait(state);
        }
    }

    fn consume_notification(&self) {
        let mut state = self.shared.state();
        while state.notifications == 0 {
            state = self.shared.wait(state);
        }
        state.notifications -= 1;
    }
}
