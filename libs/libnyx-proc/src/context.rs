//! Per-instance process state
//!
//! One [`ProcessContext`] exists per emulated process. It is created by one
//! of the two bootstrap protocols and torn down by [`ProcessContext::exit`].

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::children::{ChildEntry, ChildRegistry};
use crate::config::{LimitsConfig, ProcConfig};
use crate::error::{Errno, ProcError, Result};
use crate::signal::{ChildRegistration, SignalSubsystem, Termination};
use crate::table::{Pid, ProcessRecord, SharedTable, INIT_PID};
use crate::wait::{self, WaitOptions, WaitOutcome, WaitSelector};

/// State of one emulated process
pub struct ProcessContext {
    pid: Pid,
    table: SharedTable,
    children: ChildRegistry,
    signals: Arc<dyn SignalSubsystem>,
    limits: LimitsConfig,
    exited: bool,
}

impl ProcessContext {
    /// Fresh start: register this instance in the shared table.
    ///
    /// The first instance to find slot 1 free also creates the permanent
    /// init record. Every fresh instance is its own group and session
    /// leader and is parented to init.
    pub fn bootstrap(config: &ProcConfig, signals: Arc<dyn SignalSubsystem>) -> Result<Self> {
        let table = SharedTable::open(config)?;
        let children = ChildRegistry::new(config.child_capacity);

        let pid = {
            let mut guard = table.lock()?;
            let mut pid = guard.alloc()?;
            if pid == INIT_PID {
                guard.insert(INIT_PID, ProcessRecord::init())?;
                info!("Created init process");
                pid = guard.alloc()?;
            }
            guard.insert(
                pid,
                ProcessRecord {
                    native_pid: std::process::id(),
                    pgid: pid,
                    ppid: INIT_PID,
                    sid: pid,
                    sigwrite: signals.process_sigwrite(),
                },
            )?;
            pid
        };

        info!("PID: {}", pid);
        Ok(Self {
            pid,
            table,
            children,
            signals,
            limits: config.limits.clone(),
            exited: false,
        })
    }

    /// Continuation: attach to the slot the parent already registered
    pub fn resume(
        config: &ProcConfig,
        signals: Arc<dyn SignalSubsystem>,
        pid: Pid,
    ) -> Result<Self> {
        let table = SharedTable::open(config)?;
        let children = ChildRegistry::new(config.child_capacity);

        {
            let mut guard = table.lock()?;
            if !guard.exists(pid) {
                error!("Resumed pid {} has no table slot", pid);
                return Err(Errno::ESRCH.into());
            }
            guard.set_sigwrite(pid, signals.process_sigwrite())?;
        }

        info!("PID: {}", pid);
        Ok(Self {
            pid,
            table,
            children,
            signals,
            limits: config.limits.clone(),
            exited: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn table(&self) -> &SharedTable {
        &self.table
    }

    pub fn children(&self) -> &ChildRegistry {
        &self.children
    }

    pub fn signals(&self) -> &Arc<dyn SignalSubsystem> {
        &self.signals
    }

    /// Limits reported through getrlimit
    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Our own record, read without the lock
    pub(crate) fn own_record(&self) -> Result<ProcessRecord> {
        self.table
            .own_record(self.pid)
            .ok_or(ProcError::Errno(Errno::ESRCH))
    }

    /// Register a freshly spawned native child and give it a pid.
    ///
    /// The child inherits our group and session. The returned registration
    /// carries the [`Termination`] the signal subsystem must flip when the
    /// native process exits.
    pub fn spawn_register(&mut self, native_pid: u32) -> Result<ChildRegistration> {
        if self.children.is_full() {
            error!("Maximum number of child processes exceeded");
            return Err(ProcError::ChildPoolFull {
                capacity: self.children.capacity(),
            });
        }

        let pid = {
            let mut guard = self.table.lock()?;
            let own = guard.get(self.pid).ok_or(Errno::ESRCH)?;
            let pid = guard.alloc()?;
            guard.insert(
                pid,
                ProcessRecord {
                    native_pid,
                    pgid: own.pgid,
                    ppid: self.pid,
                    sid: own.sid,
                    sigwrite: None,
                },
            )?;
            pid
        };

        let registration = ChildRegistration {
            pid,
            native_pid,
            termination: Termination::new(),
        };
        self.children.insert(ChildEntry {
            pid,
            native_pid,
            termination: registration.termination.clone(),
        })?;
        self.signals.register_child(&registration);

        debug!("Registered child {} (native pid {})", pid, native_pid);
        Ok(registration)
    }

    /// `wait4`/`waitpid` core: reap one child and free its pid
    pub fn wait(
        &mut self,
        selector: WaitSelector,
        options: WaitOptions,
    ) -> std::result::Result<WaitOutcome, Errno> {
        let outcome = wait::wait(&mut self.children, self.signals.as_ref(), selector, options)?;
        self.reclaim(outcome.pid);
        Ok(outcome)
    }

    /// Wait for the child `pid`
    pub fn wait_specific(
        &mut self,
        pid: Pid,
        options: WaitOptions,
    ) -> std::result::Result<WaitOutcome, Errno> {
        self.wait(WaitSelector::Child(pid), options)
    }

    /// Wait for any child
    pub fn wait_any(&mut self, options: WaitOptions) -> std::result::Result<WaitOutcome, Errno> {
        self.wait(WaitSelector::Any, options)
    }

    /// A reaped child's pid goes back to the allocator
    fn reclaim(&self, child: Pid) {
        let mut guard = match self.table.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("Cannot reclaim pid {}: {}", child, e);
                return;
            }
        };
        match guard.get(child) {
            Some(record) if record.ppid == self.pid => guard.release(child),
            Some(record) => warn!(
                "pid {} now belongs to parent {}, not reclaiming",
                child, record.ppid
            ),
            None => debug!("pid {} already released", child),
        }
    }

    /// Tear the instance down.
    ///
    /// A process parented to init releases its own slot, since init never
    /// reaps. A process with a real parent keeps its slot until that parent
    /// waits for it. Unreaped children that already terminated are released;
    /// the rest are handed to init. Returns `status` for the host exit.
    pub fn exit(mut self, status: i32) -> i32 {
        info!("exit({})", status);
        self.teardown();
        status
    }

    fn teardown(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;

        let mut guard = match self.table.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("Cannot release pid {}: {}", self.pid, e);
                return;
            }
        };

        for child in self.children.iter().filter(|c| c.is_terminated()) {
            if guard.get(child.pid).is_some_and(|r| r.ppid == self.pid) {
                guard.release(child.pid);
                debug!("Released unreaped child {}", child.pid);
            }
        }
        let orphans = guard.reparent(self.pid, INIT_PID);
        if orphans > 0 {
            debug!("Reparented {} children of pid {} to init", orphans, self.pid);
        }

        match guard.get(self.pid) {
            Some(record) if record.ppid == INIT_PID => {
                guard.release(self.pid);
                debug!("Released pid {}", self.pid);
            }
            Some(record) => debug!(
                "pid {} left for parent {} to reap",
                self.pid, record.ppid
            ),
            None => warn!("pid {} missing from table at exit", self.pid),
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        if !self.exited {
            debug!("pid {} dropped without exit", self.pid);
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{LocalSignals, SigWrite};

    fn config(dir: &tempfile::TempDir) -> ProcConfig {
        ProcConfig {
            table_capacity: 16,
            child_capacity: 4,
            ..ProcConfig::default().with_runtime_dir(dir.path())
        }
    }

    fn boot(config: &ProcConfig) -> (ProcessContext, LocalSignals) {
        let signals = LocalSignals::new();
        let ctx = ProcessContext::bootstrap(config, Arc::new(signals.clone())).unwrap();
        (ctx, signals)
    }

    #[test]
    fn test_first_bootstrap_creates_init() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = boot(&config(&dir));
        assert_eq!(ctx.pid(), 2);

        let guard = ctx.table().lock().unwrap();
        assert_eq!(guard.get(INIT_PID), Some(ProcessRecord::init()));

        let own = guard.get(2).unwrap();
        assert_eq!(own.ppid, INIT_PID);
        assert_eq!(own.pgid, 2);
        assert_eq!(own.sid, 2);
        assert_eq!(own.native_pid, std::process::id());
    }

    #[test]
    fn test_second_bootstrap_reuses_init() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (a, _) = boot(&config);
        let (b, _) = boot(&config);
        assert_eq!(a.pid(), 2);
        assert_eq!(b.pid(), 3);

        let guard = b.table().lock().unwrap();
        assert_eq!(guard.live_count(), 3);
        assert_eq!(guard.get(3).unwrap().ppid, INIT_PID);
    }

    #[test]
    fn test_bootstrap_publishes_sigwrite() {
        let dir = tempfile::tempdir().unwrap();
        let signals = LocalSignals::new().with_sigwrite(SigWrite::from_raw(77).unwrap());
        let ctx = ProcessContext::bootstrap(&config(&dir), Arc::new(signals)).unwrap();
        assert_eq!(
            ctx.own_record().unwrap().sigwrite.map(SigWrite::as_raw),
            Some(77)
        );
    }

    #[test]
    fn test_spawn_register_inherits_group_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = boot(&config(&dir));
        let child = ctx.spawn_register(4321).unwrap();
        assert_eq!(child.pid, 3);

        let guard = ctx.table().lock().unwrap();
        let record = guard.get(child.pid).unwrap();
        assert_eq!(record.ppid, ctx.pid());
        assert_eq!(record.pgid, ctx.pid());
        assert_eq!(record.sid, ctx.pid());
        assert_eq!(record.native_pid, 4321);
        assert_eq!(record.sigwrite, None);
        drop(guard);
        assert_eq!(ctx.children().active_count(), 1);
    }

    #[test]
    fn test_resume_attaches_to_registered_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (mut parent, _) = boot(&config);
        let child = parent.spawn_register(999).unwrap();

        let signals = LocalSignals::new().with_sigwrite(SigWrite::from_raw(5).unwrap());
        let resumed = ProcessContext::resume(&config, Arc::new(signals), child.pid).unwrap();
        assert_eq!(resumed.pid(), child.pid);
        assert_eq!(resumed.getppid(), parent.pid());

        let record = resumed.own_record().unwrap();
        assert_eq!(record.sigwrite.map(SigWrite::as_raw), Some(5));
        assert_eq!(record.native_pid, 999);
        assert_eq!(resumed.children().active_count(), 0);
    }

    #[test]
    fn test_resume_unknown_pid() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (_ctx, _) = boot(&config);
        let err = ProcessContext::resume(&config, Arc::new(LocalSignals::new()), 9)
            .err()
            .unwrap();
        assert_eq!(err.errno(), Some(Errno::ESRCH));
    }

    #[test]
    fn test_child_pool_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = boot(&config(&dir));
        for native in 0..4 {
            ctx.spawn_register(native).unwrap();
        }
        let err = ctx.spawn_register(10).unwrap_err();
        assert!(err.is_fatal());
        // No pid was consumed by the failed attempt
        assert_eq!(ctx.table().lock().unwrap().live_count(), 6);
    }

    #[test]
    fn test_table_exhaustion_on_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcConfig {
            table_capacity: 4,
            ..config(&dir)
        };
        let (mut ctx, _) = boot(&config);
        ctx.spawn_register(1).unwrap();
        let err = ctx.spawn_register(2).unwrap_err();
        assert!(matches!(err, ProcError::TableFull { capacity: 4 }));
        assert_eq!(ctx.children().active_count(), 1);
    }

    #[test]
    fn test_reap_releases_child_pid() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, signals) = boot(&config(&dir));
        let child = ctx.spawn_register(1).unwrap();
        signals.notify_exit(&child.termination, 0);

        let outcome = ctx.wait_any(WaitOptions::empty()).unwrap();
        assert_eq!(outcome.pid, child.pid);
        assert!(!ctx.table_exists(child.pid));
        assert_eq!(ctx.wait_any(WaitOptions::WNOHANG), Err(Errno::ECHILD));
    }

    #[test]
    fn test_exit_releases_slot_of_init_child() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (a, _) = boot(&config);
        let (b, _) = boot(&config);
        let pid = a.pid();
        assert_eq!(a.exit(3), 3);
        assert!(!b.table_exists(pid));
        assert!(b.table_exists(INIT_PID));
    }

    #[test]
    fn test_exit_keeps_slot_until_parent_reaps() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (mut parent, signals) = boot(&config);
        let child = parent.spawn_register(1).unwrap();

        let resumed =
            ProcessContext::resume(&config, Arc::new(LocalSignals::new()), child.pid).unwrap();
        resumed.exit(0);
        assert!(parent.table_exists(child.pid));

        signals.notify_exit(&child.termination, 0);
        parent.wait_specific(child.pid, WaitOptions::empty()).unwrap();
        assert!(!parent.table_exists(child.pid));
    }

    #[test]
    fn test_parent_exit_hands_children_to_init() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (mut parent, _) = boot(&config);
        let (observer, _) = boot(&config);
        let child = parent.spawn_register(1).unwrap();

        let resumed =
            ProcessContext::resume(&config, Arc::new(LocalSignals::new()), child.pid).unwrap();
        parent.exit(0);
        assert_eq!(resumed.getppid(), INIT_PID);

        resumed.exit(0);
        assert!(!observer.table_exists(child.pid));
    }

    #[test]
    fn test_parent_exit_releases_terminated_children() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (mut parent, signals) = boot(&config);
        let (observer, _) = boot(&config);
        let done = parent.spawn_register(1).unwrap();
        let running = parent.spawn_register(2).unwrap();
        signals.notify_exit(&done.termination, 0);

        parent.exit(0);
        assert!(!observer.table_exists(done.pid));
        let guard = observer.table().lock().unwrap();
        assert_eq!(guard.get(running.pid).unwrap().ppid, INIT_PID);
    }

    #[test]
    fn test_drop_without_exit_releases_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (observer, _) = boot(&config);
        let pid = {
            let (ctx, _) = boot(&config);
            ctx.pid()
        };
        assert!(!observer.table_exists(pid));
        assert!(observer.table_exists(observer.pid()));
    }
}
