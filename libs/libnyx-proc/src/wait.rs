//! Wait engine
//!
//! Reconciles native child exits with `wait`/`waitpid` semantics. Per child:
//! ACTIVE -> TERMINATED (set by the signal subsystem) -> REAPED (entry back
//! in the free pool). A reap consumes exactly one child-terminated
//! notification; an interrupted or refused wait consumes none.

use bitflags::bitflags;
use tracing::{debug, error, warn};

use crate::children::{ChildEntry, ChildRegistry};
use crate::error::Errno;
use crate::signal::{SignalSubsystem, WaitResult};
use crate::table::Pid;

bitflags! {
    /// `waitpid` option flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WaitOptions: u32 {
        /// Poll instead of blocking
        const WNOHANG = libc::WNOHANG as u32;
        /// Accepted, no effect
        const WUNTRACED = libc::WUNTRACED as u32;
        /// Accepted, no effect
        const WCONTINUED = libc::WCONTINUED as u32;
    }
}

impl WaitOptions {
    /// Options from the raw syscall argument; unknown bits are kept
    pub fn from_raw(raw: i32) -> Self {
        Self::from_bits_retain(raw as u32)
    }
}

/// Which children a wait applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSelector {
    /// `pid > 0`
    Child(Pid),
    /// `pid == -1`
    Any,
    /// `pid == 0` or `pid < -1`; not supported
    Group(Pid),
}

impl WaitSelector {
    pub fn from_raw(pid: Pid) -> Self {
        match pid {
            p if p > 0 => Self::Child(p),
            -1 => Self::Any,
            p => Self::Group(p),
        }
    }
}

/// POSIX-encoded wait status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ExitStatus(i32);

impl ExitStatus {
    /// Normal exit with `code` (`W_EXITCODE(code, 0)`)
    pub const fn exited(code: i32) -> Self {
        Self((code & 0xff) << 8)
    }

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// `WEXITSTATUS`, if `WIFEXITED`
    pub const fn exit_code(self) -> Option<i32> {
        if self.0 & 0x7f == 0 {
            Some((self.0 >> 8) & 0xff)
        } else {
            None
        }
    }
}

/// A reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub pid: Pid,
    pub native_pid: u32,
    pub status: ExitStatus,
}

/// Run one wait against the local registry
pub fn wait(
    children: &mut ChildRegistry,
    signals: &dyn SignalSubsystem,
    selector: WaitSelector,
    options: WaitOptions,
) -> Result<WaitOutcome, Errno> {
    if options.contains(WaitOptions::WUNTRACED) {
        warn!("Unhandled option WUNTRACED");
    }
    if options.contains(WaitOptions::WCONTINUED) {
        warn!("Unhandled option WCONTINUED");
    }
    let nohang = options.contains(WaitOptions::WNOHANG);

    let entry = match selector {
        WaitSelector::Child(pid) => wait_child(children, signals, pid, nohang)?,
        WaitSelector::Any => wait_any(children, signals, nohang)?,
        WaitSelector::Group(pid) => {
            warn!("Group wait (pid {}) unsupported", pid);
            return Err(Errno::EINVAL);
        }
    };

    let code = entry.termination.exit_code().unwrap_or_else(|| {
        error!("Reaped child {} without an exit code", entry.pid);
        0
    });
    debug!("pid: {} exit code: {}", entry.pid, code);

    Ok(WaitOutcome {
        pid: entry.pid,
        native_pid: entry.native_pid,
        status: ExitStatus::exited(code),
    })
}

fn wait_child(
    children: &mut ChildRegistry,
    signals: &dyn SignalSubsystem,
    pid: Pid,
    nohang: bool,
) -> Result<ChildEntry, Errno> {
    let Some(cursor) = children.find(pid) else {
        warn!("pid {} is not a child", pid);
        return Err(Errno::ECHILD);
    };
    let termination = children
        .get(cursor)
        .map(|entry| entry.termination.clone())
        .ok_or(Errno::ECHILD)?;

    if nohang {
        if !termination.is_terminated() {
            return Err(Errno::ECHILD);
        }
    } else if signals.wait_child(&termination) == WaitResult::Interrupted {
        return Err(Errno::EINTR);
    }

    signals.consume_notification();
    children.remove(cursor).ok_or(Errno::ECHILD)
}

fn wait_any(
    children: &mut ChildRegistry,
    signals: &dyn SignalSubsystem,
    nohang: bool,
) -> Result<ChildEntry, Errno> {
    if children.active_count() == 0 {
        warn!("No children");
        return Err(Errno::ECHILD);
    }

    if !nohang && signals.wait_notification() == WaitResult::Interrupted {
        return Err(Errno::EINTR);
    }

    let Some(cursor) = children.find_terminated() else {
        if !nohang {
            error!("Child-terminated notification without a terminated child");
        }
        return Err(Errno::ECHILD);
    };

    if nohang {
        // The blocking path already took its unit in wait_notification
        signals.consume_notification();
    }
    children.remove(cursor).ok_or(Errno::ECHILD)
}
