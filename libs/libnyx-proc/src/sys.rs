//! Syscall adapters
//!
//! Thin wrappers with the Linux calling convention: a non-negative value on
//! success, `-errno` on failure. User buffers are addresses in the guest
//! and must pass the [`AddressSpace`] check before they are touched.
//!
//! Calls that are only partially emulated still succeed; the gap shows up
//! in the log, never in the return value.

use std::mem;
use tracing::{debug, error, warn};

use crate::context::ProcessContext;
use crate::error::{Errno, ProcError};
use crate::signal::ChildRegistration;
use crate::wait::{WaitOptions, WaitSelector};

/// Address-validation collaborator
pub trait AddressSpace {
    /// Whether `len` bytes at `addr` may be read
    fn check_read(&self, addr: usize, len: usize) -> bool;

    /// Whether `len` bytes at `addr` may be written
    fn check_write(&self, addr: usize, len: usize) -> bool;

    /// Copy `bytes` to `addr`. Only called after `check_write` succeeded.
    fn write_bytes(&mut self, addr: usize, bytes: &[u8]);

    /// Copy from `addr` into `buf`. Only called after `check_read` succeeded.
    fn read_bytes(&self, addr: usize, buf: &mut [u8]);
}

/// `struct robust_list_head` on 64-bit Linux
const ROBUST_LIST_HEAD_SIZE: usize = 24;

const AFFINITY_CHUNK: usize = 256;

/// `struct rlimit` on 64-bit Linux
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub cur: u64,
    pub max: u64,
}

impl Rlimit {
    const SIZE: usize = 16;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.cur.to_ne_bytes());
        out[8..].copy_from_slice(&self.max.to_ne_bytes());
        out
    }

    fn fixed(value: u64) -> Self {
        Self {
            cur: value,
            max: value,
        }
    }
}

type SysResult = Result<i64, Errno>;

fn ret(result: SysResult) -> i64 {
    result.unwrap_or_else(Errno::as_neg)
}

/// Syscalls of one process against its guest memory
pub struct Syscalls<'a, M: AddressSpace> {
    ctx: &'a mut ProcessContext,
    mm: &'a mut M,
}

impl<'a, M: AddressSpace> Syscalls<'a, M> {
    pub fn new(ctx: &'a mut ProcessContext, mm: &'a mut M) -> Self {
        Self { ctx, mm }
    }

    fn put(&mut self, addr: usize, bytes: &[u8]) -> Result<(), Errno> {
        if !self.mm.check_write(addr, bytes.len()) {
            return Err(Errno::EFAULT);
        }
        self.mm.write_bytes(addr, bytes);
        Ok(())
    }

    fn put_u32s(&mut self, addrs: &[usize], value: u32) -> Result<(), Errno> {
        let size = mem::size_of::<u32>();
        if addrs.iter().any(|&addr| !self.mm.check_write(addr, size)) {
            return Err(Errno::EFAULT);
        }
        for &addr in addrs {
            self.mm.write_bytes(addr, &value.to_ne_bytes());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wait family
    // ------------------------------------------------------------------

    pub fn waitpid(&mut self, pid: i32, status_addr: usize, options: i32) -> i64 {
        debug!("waitpid({}, {:#x}, {})", pid, status_addr, options);
        ret(self.do_wait(pid, status_addr, options))
    }

    pub fn wait4(&mut self, pid: i32, status_addr: usize, options: i32, rusage_addr: usize) -> i64 {
        debug!(
            "wait4({}, {:#x}, {}, {:#x})",
            pid, status_addr, options, rusage_addr
        );
        if rusage_addr != 0 {
            warn!("rusage not supported");
        }
        ret(self.do_wait(pid, status_addr, options))
    }

    fn do_wait(&mut self, pid: i32, status_addr: usize, options: i32) -> SysResult {
        let status_size = mem::size_of::<i32>();
        if status_addr != 0 && !self.mm.check_write(status_addr, status_size) {
            return Err(Errno::EFAULT);
        }

        let outcome = self
            .ctx
            .wait(WaitSelector::from_raw(pid), WaitOptions::from_raw(options))?;

        if status_addr != 0 {
            self.mm
                .write_bytes(status_addr, &outcome.status.raw().to_ne_bytes());
        }
        Ok(outcome.pid as i64)
    }

    /// Give a newly spawned native child a pid.
    ///
    /// Table or child-pool exhaustion aborts the instance.
    pub fn spawn_register(&mut self, native_pid: u32) -> Result<ChildRegistration, Errno> {
        match self.ctx.spawn_register(native_pid) {
            Ok(registration) => Ok(registration),
            Err(e) if e.is_fatal() => {
                error!("Cannot register child (native pid {}): {}", native_pid, e);
                std::process::abort();
            }
            Err(ProcError::Errno(e)) => Err(e),
            Err(e) => {
                error!("Cannot register child (native pid {}): {}", native_pid, e);
                Err(Errno::ESRCH)
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn getpid(&self) -> i64 {
        let pid = self.ctx.getpid();
        debug!("getpid(): {}", pid);
        pid as i64
    }

    pub fn gettid(&self) -> i64 {
        let tid = self.ctx.gettid();
        debug!("gettid(): {}", tid);
        tid as i64
    }

    pub fn getppid(&self) -> i64 {
        let ppid = self.ctx.getppid();
        debug!("getppid(): {}", ppid);
        ppid as i64
    }

    pub fn getpgid(&self, pid: i32) -> i64 {
        let result = self.ctx.getpgid(pid).map(i64::from);
        debug!("getpgid({}): {:?}", pid, result);
        ret(result)
    }

    pub fn getpgrp(&self) -> i64 {
        debug!("getpgrp()");
        ret(self.ctx.getpgrp().map(i64::from))
    }

    pub fn getsid(&self) -> i64 {
        let sid = self.ctx.getsid();
        debug!("getsid(): {}", sid);
        sid as i64
    }

    pub fn setpgid(&self, pid: i32, pgid: i32) -> i64 {
        debug!("setpgid({}, {})", pid, pgid);
        self.ctx.setpgid(pid, pgid);
        0
    }

    pub fn setsid(&self) -> i64 {
        debug!("setsid()");
        self.ctx.setsid();
        0
    }

    // ------------------------------------------------------------------
    // Credentials: a single root pseudo-user
    // ------------------------------------------------------------------

    pub fn getuid(&self) -> i64 {
        debug!("getuid(): 0");
        0
    }

    pub fn geteuid(&self) -> i64 {
        debug!("geteuid(): 0");
        0
    }

    pub fn getgid(&self) -> i64 {
        debug!("getgid(): 0");
        0
    }

    pub fn getegid(&self) -> i64 {
        debug!("getegid(): 0");
        0
    }

    pub fn setuid(&self, uid: u32) -> i64 {
        debug!("setuid({})", uid);
        0
    }

    pub fn setgid(&self, gid: u32) -> i64 {
        debug!("setgid({})", gid);
        0
    }

    pub fn setresuid(&self, ruid: u32, euid: u32, suid: u32) -> i64 {
        debug!("setresuid({}, {}, {})", ruid, euid, suid);
        0
    }

    pub fn setresgid(&self, rgid: u32, egid: u32, sgid: u32) -> i64 {
        debug!("setresgid({}, {}, {})", rgid, egid, sgid);
        0
    }

    pub fn getresuid(&mut self, ruid: usize, euid: usize, suid: usize) -> i64 {
        debug!("getresuid({:#x}, {:#x}, {:#x})", ruid, euid, suid);
        ret(self.put_u32s(&[ruid, euid, suid], 0).map(|_| 0))
    }

    pub fn getresgid(&mut self, rgid: usize, egid: usize, sgid: usize) -> i64 {
        debug!("getresgid({:#x}, {:#x}, {:#x})", rgid, egid, sgid);
        ret(self.put_u32s(&[rgid, egid, sgid], 0).map(|_| 0))
    }

    /// No supplementary groups
    pub fn getgroups(&self, size: i32, list: usize) -> i64 {
        debug!("getgroups({}, {:#x})", size, list);
        0
    }

    // ------------------------------------------------------------------
    // Resource limits and usage
    // ------------------------------------------------------------------

    pub fn getrlimit(&mut self, resource: i32, addr: usize) -> i64 {
        debug!("getrlimit({}, {:#x})", resource, addr);
        if !self.mm.check_write(addr, Rlimit::SIZE) {
            return Errno::EFAULT.as_neg();
        }

        let limits = self.ctx.limits();
        let limit = match resource {
            r if r == libc::RLIMIT_STACK as i32 => Rlimit::fixed(limits.stack_size),
            r if r == libc::RLIMIT_NPROC as i32 => {
                debug!("RLIMIT_NPROC: return fake result");
                Rlimit::fixed(limits.max_processes)
            }
            r if r == libc::RLIMIT_NOFILE as i32 => Rlimit::fixed(limits.max_open_files),
            _ => {
                warn!("Unsupported resource: {}", resource);
                return Errno::EINVAL.as_neg();
            }
        };

        self.mm.write_bytes(addr, &limit.to_bytes());
        0
    }

    /// Limits are reported, never changed
    pub fn setrlimit(&mut self, resource: i32, addr: usize) -> i64 {
        debug!("setrlimit({}, {:#x})", resource, addr);
        if !self.mm.check_read(addr, Rlimit::SIZE) {
            return Errno::EFAULT.as_neg();
        }
        warn!("Unsupported resource: {}", resource);
        Errno::EINVAL.as_neg()
    }

    /// Always reports zero usage
    pub fn getrusage(&mut self, who: i32, addr: usize) -> i64 {
        debug!("getrusage({}, {:#x})", who, addr);
        let zeroed = [0u8; mem::size_of::<libc::rusage>()];
        if let Err(e) = self.put(addr, &zeroed) {
            return e.as_neg();
        }

        match who {
            libc::RUSAGE_SELF | libc::RUSAGE_CHILDREN | libc::RUSAGE_THREAD => 0,
            _ => {
                warn!("Unhandled who: {}", who);
                Errno::EINVAL.as_neg()
            }
        }
    }

    pub fn prlimit64(&self, pid: i32, resource: i32, new_limit: usize, old_limit: usize) -> i64 {
        debug!(
            "prlimit64(pid={}, resource={}, new_limit={:#x}, old_limit={:#x})",
            pid, resource, new_limit, old_limit
        );
        warn!("prlimit64() not implemented");
        0
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Report exactly one usable CPU so guests stay single-threaded
    pub fn sched_getaffinity(&mut self, pid: i32, cpusetsize: usize, addr: usize) -> i64 {
        debug!("sched_getaffinity({}, {}, {:#x})", pid, cpusetsize, addr);
        if pid != 0 && pid != self.ctx.pid() {
            warn!("sched_getaffinity on foreign pid {}", pid);
            return Errno::ESRCH.as_neg();
        }

        let bytes = match cpusetsize.checked_add(7) {
            Some(size) => size & !7,
            None => return Errno::EINVAL.as_neg(),
        };
        if bytes == 0 {
            return Errno::EINVAL.as_neg();
        }
        if !self.mm.check_write(addr, bytes) {
            return Errno::EFAULT.as_neg();
        }

        // Written in chunks; the mask size comes from the guest
        let mut chunk = [0u8; AFFINITY_CHUNK];
        chunk[0] = 1;
        let mut offset = 0;
        while offset < bytes {
            let len = AFFINITY_CHUNK.min(bytes - offset);
            self.mm.write_bytes(addr + offset, &chunk[..len]);
            chunk[0] = 0;
            offset += len;
        }
        mem::size_of::<usize>() as i64
    }

    pub fn getcpu(&mut self, cpu: usize, node: usize) -> i64 {
        debug!("getcpu({:#x}, {:#x})", cpu, node);
        let addrs: Vec<usize> = [cpu, node].into_iter().filter(|&a| a != 0).collect();
        ret(self.put_u32s(&addrs, 0).map(|_| 0))
    }

    pub fn getpriority(&self, which: i32, who: i32) -> i64 {
        debug!("getpriority(which={}, who={})", which, who);
        warn!("getpriority() not implemented. Fake returning 0.");
        0
    }

    pub fn setpriority(&self, which: i32, who: i32, prio: i32) -> i64 {
        debug!("setpriority(which={}, who={}, prio={})", which, who, prio);
        warn!("setpriority() not implemented. Fake returning 0.");
        0
    }

    // ------------------------------------------------------------------
    // Process control stubs
    // ------------------------------------------------------------------

    pub fn prctl(&self, option: i32) -> i64 {
        debug!("prctl({})", option);
        warn!("prctl() not implemented");
        0
    }

    pub fn capget(&self, header: usize, data: usize) -> i64 {
        debug!("capget({:#x}, {:#x})", header, data);
        warn!("capget() not implemented");
        0
    }

    pub fn capset(&self, header: usize, data: usize) -> i64 {
        debug!("capset({:#x}, {:#x})", header, data);
        warn!("capset() not implemented");
        0
    }

    pub fn set_tid_address(&self, tidptr: usize) -> i64 {
        debug!("set_tid_address(tidptr={:#x})", tidptr);
        warn!("clear_child_tid not supported");
        self.ctx.gettid() as i64
    }

    pub fn futex(&self, uaddr: usize, op: i32, val: i32) -> i64 {
        debug!("futex({:#x}, {}, {})", uaddr, op, val);
        warn!("Unsupported futex operation, returning -ENOSYS");
        Errno::ENOSYS.as_neg()
    }

    pub fn set_robust_list(&self, head: usize, len: usize) -> i64 {
        debug!("set_robust_list(head={:#x}, len={})", head, len);
        if len != ROBUST_LIST_HEAD_SIZE {
            warn!("len ({}) != sizeof(struct robust_list_head)", len);
        }
        warn!("set_robust_list() not supported");
        0
    }
}

/// `exit`: tear the process down and hand back the host exit status
pub fn exit(ctx: ProcessContext, status: i32) -> i32 {
    debug!("exit({})", status);
    ctx.exit(status)
}

/// `exit_group`: identical to `exit` with one context per process
pub fn exit_group(ctx: ProcessContext, status: i32) -> i32 {
    debug!("exit_group({})", status);
    ctx.exit(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcConfig;
    use crate::signal::LocalSignals;
    use crate::table::INIT_PID;
    use std::sync::Arc;

    const BASE: usize = 0x1000;

    /// Guest memory: one flat mapping at BASE
    struct FlatMemory {
        bytes: Vec<u8>,
    }

    impl FlatMemory {
        fn new(len: usize) -> Self {
            Self {
                bytes: vec![0xaa; len],
            }
        }

        fn range(&self, addr: usize, len: usize) -> Option<std::ops::Range<usize>> {
            let start = addr.checked_sub(BASE)?;
            let end = start.checked_add(len)?;
            (end <= self.bytes.len()).then_some(start..end)
        }

        fn u32_at(&self, addr: usize) -> u32 {
            let r = self.range(addr, 4).unwrap();
            u32::from_ne_bytes(self.bytes[r].try_into().unwrap())
        }

        fn i32_at(&self, addr: usize) -> i32 {
            self.u32_at(addr) as i32
        }

        fn u64_at(&self, addr: usize) -> u64 {
            let r = self.range(addr, 8).unwrap();
            u64::from_ne_bytes(self.bytes[r].try_into().unwrap())
        }
    }

    impl AddressSpace for FlatMemory {
        fn check_read(&self, addr: usize, len: usize) -> bool {
            self.range(addr, len).is_some()
        }

        fn check_write(&self, addr: usize, len: usize) -> bool {
            self.range(addr, len).is_some()
        }

        fn write_bytes(&mut self, addr: usize, bytes: &[u8]) {
            let r = self.range(addr, bytes.len()).unwrap();
            self.bytes[r].copy_from_slice(bytes);
        }

        fn read_bytes(&self, addr: usize, buf: &mut [u8]) {
            let r = self.range(addr, buf.len()).unwrap();
            buf.copy_from_slice(&self.bytes[r]);
        }
    }

    fn setup(dir: &tempfile::TempDir) -> (ProcessContext, LocalSignals) {
        let config = ProcConfig {
            table_capacity: 16,
            child_capacity: 4,
            ..ProcConfig::default().with_runtime_dir(dir.path())
        };
        let signals = LocalSignals::new();
        let ctx = ProcessContext::bootstrap(&config, Arc::new(signals.clone())).unwrap();
        (ctx, signals)
    }

    #[test]
    fn test_waitpid_stores_status() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, signals) = setup(&dir);
        let child = ctx.spawn_register(1).unwrap();
        signals.notify_exit(&child.termination, 7);

        let mut mm = FlatMemory::new(64);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);
        assert_eq!(sys.waitpid(-1, BASE, 0), child.pid as i64);
        assert_eq!(sys.waitpid(-1, BASE, 0), Errno::ECHILD.as_neg());
        drop(sys);

        let status = mm.i32_at(BASE);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 7);
    }

    #[test]
    fn test_waitpid_bad_status_address_keeps_child() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, signals) = setup(&dir);
        let child = ctx.spawn_register(1).unwrap();
        signals.notify_exit(&child.termination, 0);

        let mut mm = FlatMemory::new(64);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);
        assert_eq!(sys.waitpid(child.pid, 0x10, 0), Errno::EFAULT.as_neg());
        assert_eq!(sys.wait4(child.pid, 0, 0, BASE), child.pid as i64);
    }

    #[test]
    fn test_waitpid_group_selector() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(64);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);
        assert_eq!(sys.waitpid(0, 0, 0), Errno::EINVAL.as_neg());
        assert_eq!(sys.waitpid(-3, 0, libc::WNOHANG), Errno::EINVAL.as_neg());
    }

    #[test]
    fn test_identity_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(64);
        let sys = Syscalls::new(&mut ctx, &mut mm);
        assert_eq!(sys.getpid(), 2);
        assert_eq!(sys.gettid(), 2);
        assert_eq!(sys.getppid(), INIT_PID as i64);
        assert_eq!(sys.getpgid(0), 2);
        assert_eq!(sys.getpgid(12), Errno::ESRCH.as_neg());
        assert_eq!(sys.getpgrp(), 2);
        assert_eq!(sys.getsid(), 2);
        assert_eq!(sys.setpgid(0, 5), 0);
        assert_eq!(sys.setsid(), 0);
        assert_eq!(sys.getpgid(0), 2);
        assert_eq!(sys.set_tid_address(BASE), 2);
    }

    #[test]
    fn test_credentials_are_root() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(64);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);
        assert_eq!(sys.getuid(), 0);
        assert_eq!(sys.geteuid(), 0);
        assert_eq!(sys.getgid(), 0);
        assert_eq!(sys.getegid(), 0);
        assert_eq!(sys.setuid(1000), 0);
        assert_eq!(sys.setgid(1000), 0);
        assert_eq!(sys.setresuid(1, 2, 3), 0);
        assert_eq!(sys.setresgid(1, 2, 3), 0);
        assert_eq!(sys.getuid(), 0);
        assert_eq!(sys.getgroups(0, 0), 0);

        assert_eq!(sys.getresuid(BASE, BASE + 4, BASE + 8), 0);
        assert_eq!(sys.getresgid(BASE + 12, BASE + 16, 0x20), Errno::EFAULT.as_neg());
        drop(sys);
        for offset in [0, 4, 8] {
            assert_eq!(mm.u32_at(BASE + offset), 0);
        }
        // Nothing written when one address is bad
        assert_eq!(mm.u32_at(BASE + 12), 0xaaaa_aaaa);
    }

    #[test]
    fn test_getrlimit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(64);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);

        assert_eq!(sys.getrlimit(libc::RLIMIT_NOFILE as i32, BASE), 0);
        assert_eq!(sys.getrlimit(libc::RLIMIT_STACK as i32, BASE + 16), 0);
        assert_eq!(sys.getrlimit(libc::RLIMIT_NPROC as i32, BASE + 32), 0);
        assert_eq!(
            sys.getrlimit(libc::RLIMIT_CPU as i32, BASE + 48),
            Errno::EINVAL.as_neg()
        );
        assert_eq!(
            sys.getrlimit(libc::RLIMIT_NOFILE as i32, 0),
            Errno::EFAULT.as_neg()
        );
        drop(sys);

        assert_eq!(mm.u64_at(BASE), 1024);
        assert_eq!(mm.u64_at(BASE + 8), 1024);
        assert_eq!(mm.u64_at(BASE + 16), 8 * 1024 * 1024);
        assert_eq!(mm.u64_at(BASE + 32), 65536);
    }

    #[test]
    fn test_setrlimit_always_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(64);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);
        assert_eq!(
            sys.setrlimit(libc::RLIMIT_NOFILE as i32, BASE),
            Errno::EINVAL.as_neg()
        );
        assert_eq!(
            sys.setrlimit(libc::RLIMIT_NOFILE as i32, 0),
            Errno::EFAULT.as_neg()
        );
    }

    #[test]
    fn test_getrusage_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let size = mem::size_of::<libc::rusage>();
        let mut mm = FlatMemory::new(size * 2);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);

        assert_eq!(sys.getrusage(libc::RUSAGE_SELF, BASE), 0);
        assert_eq!(sys.getrusage(libc::RUSAGE_CHILDREN, BASE), 0);
        assert_eq!(sys.getrusage(42, BASE + size), Errno::EINVAL.as_neg());
        assert_eq!(sys.getrusage(libc::RUSAGE_SELF, 0), Errno::EFAULT.as_neg());
        drop(sys);
        assert!(mm.bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sched_getaffinity_single_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(64);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);

        assert_eq!(
            sys.sched_getaffinity(0, 5, BASE),
            mem::size_of::<usize>() as i64
        );
        assert_eq!(sys.sched_getaffinity(2, 16, BASE), mem::size_of::<usize>() as i64);
        assert_eq!(sys.sched_getaffinity(9, 8, BASE), Errno::ESRCH.as_neg());
        assert_eq!(sys.sched_getaffinity(0, 8, 0), Errno::EFAULT.as_neg());
        assert_eq!(sys.sched_getaffinity(0, 0, BASE), Errno::EINVAL.as_neg());
        drop(sys);

        assert_eq!(mm.bytes[0], 1);
        assert!(mm.bytes[1..16].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sched_getaffinity_huge_size() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(64);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);

        assert_eq!(sys.sched_getaffinity(0, usize::MAX, BASE), Errno::EINVAL.as_neg());
        assert_eq!(
            sys.sched_getaffinity(0, usize::MAX - 3, BASE),
            Errno::EINVAL.as_neg()
        );
        assert_eq!(sys.sched_getaffinity(0, 1 << 40, BASE), Errno::EFAULT.as_neg());
        assert_eq!(sys.sched_getaffinity(0, 1 << 40, 0x10), Errno::EFAULT.as_neg());
        drop(sys);
        assert!(mm.bytes.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_sched_getaffinity_spans_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(1024);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);

        assert_eq!(
            sys.sched_getaffinity(0, 600, BASE),
            mem::size_of::<usize>() as i64
        );
        drop(sys);
        assert_eq!(mm.bytes[0], 1);
        assert!(mm.bytes[1..600].iter().all(|&b| b == 0));
        assert!(mm.bytes[600..].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_getcpu() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(16);
        let mut sys = Syscalls::new(&mut ctx, &mut mm);
        assert_eq!(sys.getcpu(BASE, 0), 0);
        assert_eq!(sys.getcpu(0, 0), 0);
        assert_eq!(sys.getcpu(BASE, 0x20), Errno::EFAULT.as_neg());
        drop(sys);
        assert_eq!(mm.u32_at(BASE), 0);
    }

    #[test]
    fn test_stubs_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _) = setup(&dir);
        let mut mm = FlatMemory::new(16);
        let sys = Syscalls::new(&mut ctx, &mut mm);
        assert_eq!(sys.getpriority(0, 0), 0);
        assert_eq!(sys.setpriority(0, 0, 10), 0);
        assert_eq!(sys.prctl(15), 0);
        assert_eq!(sys.capget(BASE, BASE), 0);
        assert_eq!(sys.capset(BASE, BASE), 0);
        assert_eq!(sys.prlimit64(0, 7, 0, 0), 0);
        assert_eq!(sys.set_robust_list(BASE, ROBUST_LIST_HEAD_SIZE), 0);
        assert_eq!(sys.set_robust_list(BASE, 3), 0);
        assert_eq!(sys.futex(BASE, 0, 0), Errno::ENOSYS.as_neg());
    }

    #[test]
    fn test_exit_returns_status() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = setup(&dir);
        assert_eq!(exit_group(ctx, 4), 4);
        assert!(dir.path().join("nyx-proc.table").exists());
    }
}
