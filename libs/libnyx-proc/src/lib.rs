//! # libnyx-proc - Linux Process Model Emulation
//!
//! Gives independently launched instances of the emulator one shared view
//! of a Linux process model: pids, parent/child links, process groups,
//! sessions and the `wait` family.
//!
//! ## Features
//!
//! - **Shared process table** - Memory-mapped pid table guarded by a named lock
//! - **Pid allocation** - Rotating allocation with a reserved init process
//! - **Child tracking** - Fixed pool of unreaped children per instance
//! - **Wait engine** - `wait4`/`waitpid` semantics over native child exits
//! - **Syscall adapters** - Identity, credential and limit calls with Linux return codes
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::process::Command;
//! use std::sync::Arc;
//! use libnyx_proc::{LocalSignals, ProcConfig, ProcessContext, WaitOptions};
//!
//! # fn main() -> libnyx_proc::Result<()> {
//! let signals = LocalSignals::new();
//! let mut ctx = ProcessContext::bootstrap(&ProcConfig::default(), Arc::new(signals.clone()))?;
//!
//! let child = Command::new("true").spawn()?;
//! let registration = ctx.spawn_register(child.id())?;
//! signals.watch_native(child, registration.termination.clone());
//!
//! let outcome = ctx.wait_any(WaitOptions::empty())?;
//! println!("pid {} exited with {:?}", outcome.pid, outcome.status.exit_code());
//! # Ok(())
//! # }
//! ```

pub mod children;
pub mod config;
pub mod context;
pub mod error;
pub mod query;
pub mod shm;
pub mod signal;
pub mod sys;
pub mod table;
pub mod wait;

pub use config::{LimitsConfig, ProcConfig};
pub use context::ProcessContext;
pub use error::{Errno, ProcError, Result};
pub use query::{EntryKind, ProcDir, ProcDirEntry};
pub use signal::{ChildRegistration, LocalSignals, SigWrite, SignalSubsystem, Termination, WaitResult};
pub use sys::{AddressSpace, Syscalls};
pub use table::{Pid, ProcessRecord, SharedTable, INIT_PID};
pub use wait::{ExitStatus, WaitOptions, WaitOutcome, WaitSelector};
