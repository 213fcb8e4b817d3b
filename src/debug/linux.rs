//! Linux ptrace backend
//!
//! Live-process implementation of [`TargetBackend`] for x86_64 Linux.
//! Memory goes through `/proc/<pid>/mem`, the map through
//! `/proc/<pid>/maps`, and control through ptrace. Signal stops are
//! translated into the same [`RawStopEvent`] vocabulary the simulator
//! emits, so everything above this file is backend-agnostic.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::core::error::{DebugError, Result};
use crate::core::memory::{MemoryRegion, Protection};
use crate::core::registers::RegisterSet;
use crate::debug::{FaultKind, HwSlotSpec, RawStopEvent, StopSignal, TargetBackend, ThreadId};

/// The x86 int3 opcode, which doubles as the engine's trap byte.
const INT3: u8 = 0xCC;

fn backend_err(operation: &'static str, e: impl std::fmt::Display) -> DebugError {
    DebugError::Backend {
        operation,
        reason: e.to_string(),
    }
}

/// ptrace-attached native process.
pub struct PtraceTarget {
    pid: Pid,
    mem: File,
    interrupt: Arc<AtomicBool>,
    /// Set while a single-step request is outstanding, to tell the two
    /// SIGTRAP flavors apart.
    stepping: bool,
}

impl PtraceTarget {
    /// Attach to a running process and wait for the attach stop.
    pub fn attach(pid: u32) -> Result<Self> {
        let nix_pid = Pid::from_raw(pid as i32);
        ptrace::attach(nix_pid).map_err(|e| match e {
            nix::errno::Errno::EPERM => DebugError::PermissionDenied {
                operation: "ptrace attach",
            },
            nix::errno::Errno::ESRCH => DebugError::TargetUnreachable {
                pid,
                reason: "no such process".into(),
            },
            other => DebugError::TargetUnreachable {
                pid,
                reason: other.to_string(),
            },
        })?;
        waitpid(nix_pid, None).map_err(|e| DebugError::TargetUnreachable {
            pid,
            reason: format!("attach wait failed: {e}"),
        })?;
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => DebugError::PermissionDenied {
                    operation: "open /proc/<pid>/mem",
                },
                _ => DebugError::TargetUnreachable {
                    pid,
                    reason: e.to_string(),
                },
            })?;
        log::info!("ptrace attached to pid {pid}");
        Ok(Self {
            pid: nix_pid,
            mem,
            interrupt: Arc::new(AtomicBool::new(false)),
            stepping: false,
        })
    }

    fn pc(&self) -> Result<u64> {
        let regs = ptrace::getregs(self.pid).map_err(|e| backend_err("getregs", e))?;
        Ok(regs.rip)
    }

    /// Translate one wait status into a raw stop event.
    fn classify_stop(&mut self, status: WaitStatus) -> Result<RawStopEvent> {
        let tid = self.pid.as_raw() as ThreadId;
        let was_step = std::mem::take(&mut self.stepping);
        match status {
            WaitStatus::Exited(_, code) => Ok(RawStopEvent::Exited { code: code as i64 }),
            WaitStatus::Signaled(_, sig, _) => Ok(RawStopEvent::Exited {
                code: -(sig as i32) as i64,
            }),
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                if was_step {
                    return Ok(RawStopEvent::SingleStep { tid, pc: self.pc()? });
                }
                // int3 leaves rip one past the trap byte; rewind so the
                // layers above see pc on the trap, like the simulator
                let mut regs =
                    ptrace::getregs(self.pid).map_err(|e| backend_err("getregs", e))?;
                let trap_pc = regs.rip.wrapping_sub(1);
                let mut byte = [0u8; 1];
                if self.read_memory(trap_pc, &mut byte).is_ok() && byte[0] == INT3 {
                    regs.rip = trap_pc;
                    ptrace::setregs(self.pid, regs).map_err(|e| backend_err("setregs", e))?;
                    return Ok(RawStopEvent::Trap { tid, pc: trap_pc });
                }
                Ok(RawStopEvent::Signal {
                    tid,
                    signal: StopSignal::Os(Signal::SIGTRAP as i32),
                    pc: regs.rip,
                })
            }
            WaitStatus::Stopped(_, sig) => {
                let pc = self.pc()?;
                let fault_kind = match sig {
                    Signal::SIGSEGV => Some(FaultKind::Segfault),
                    Signal::SIGILL => Some(FaultKind::IllegalInstruction),
                    Signal::SIGBUS => Some(FaultKind::BusError),
                    Signal::SIGFPE => Some(FaultKind::DivideByZero),
                    _ => None,
                };
                if let Some(kind) = fault_kind {
                    let address = ptrace::getsiginfo(self.pid)
                        .ok()
                        .map(|si| unsafe { si.si_addr() } as u64)
                        .unwrap_or(0);
                    return Ok(RawStopEvent::Fault {
                        tid,
                        pc,
                        kind,
                        address,
                    });
                }
                if sig == Signal::SIGSTOP {
                    return Ok(RawStopEvent::Signal {
                        tid,
                        signal: StopSignal::Stop,
                        pc,
                    });
                }
                Ok(RawStopEvent::Signal {
                    tid,
                    signal: StopSignal::Os(sig as i32),
                    pc,
                })
            }
            other => Err(DebugError::Backend {
                operation: "waitpid",
                reason: format!("unexpected wait status {other:?}"),
            }),
        }
    }
}

impl TargetBackend for PtraceTarget {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn memory_map(&mut self) -> Result<Vec<MemoryRegion>> {
        let path = format!("/proc/{}/maps", self.pid);
        let text = std::fs::read_to_string(&path).map_err(|e| backend_err("read maps", e))?;
        let mut regions = Vec::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let range = fields.next().unwrap_or("");
            let perms = fields.next().unwrap_or("");
            // skip offset, dev, inode
            let name = fields.nth(3).map(str::to_string);
            let (start, end) = match range.split_once('-') {
                Some(pair) => pair,
                None => continue,
            };
            let base = u64::from_str_radix(start, 16)
                .map_err(|e| backend_err("parse maps", e))?;
            let end = u64::from_str_radix(end, 16).map_err(|e| backend_err("parse maps", e))?;
            let protection: Protection = perms
                .parse()
                .map_err(|e: String| backend_err("parse maps", e))?;
            regions.push(MemoryRegion {
                base,
                len: end - base,
                protection,
                name,
            });
        }
        Ok(regions)
    }

    fn threads(&mut self) -> Result<Vec<ThreadId>> {
        let dir = format!("/proc/{}/task", self.pid);
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| backend_err("read task dir", e))? {
            let entry = entry.map_err(|e| backend_err("read task dir", e))?;
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<ThreadId>() {
                tids.push(tid);
            }
        }
        tids.sort_unstable();
        Ok(tids)
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.mem
            .seek(SeekFrom::Start(addr))
            .and_then(|_| self.mem.read_exact(buf))
            .map_err(|_| DebugError::InvalidAddress { address: addr })
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.mem
            .seek(SeekFrom::Start(addr))
            .and_then(|_| self.mem.write_all(data))
            .map_err(|_| DebugError::InvalidAddress { address: addr })
    }

    fn read_registers(&mut self, _tid: ThreadId) -> Result<RegisterSet> {
        let r = ptrace::getregs(self.pid).map_err(|e| backend_err("getregs", e))?;
        let mut set = RegisterSet::new();
        set.set_pc(r.rip);
        set.set_sp(r.rsp);
        set.set_fp(r.rbp);
        for (name, value) in [
            ("rax", r.rax),
            ("rbx", r.rbx),
            ("rcx", r.rcx),
            ("rdx", r.rdx),
            ("rsi", r.rsi),
            ("rdi", r.rdi),
            ("r8", r.r8),
            ("r9", r.r9),
            ("r10", r.r10),
            ("r11", r.r11),
            ("r12", r.r12),
            ("r13", r.r13),
            ("r14", r.r14),
            ("r15", r.r15),
            ("eflags", r.eflags),
        ] {
            set.set(name, value);
        }
        Ok(set)
    }

    fn write_registers(&mut self, _tid: ThreadId, regs: &RegisterSet) -> Result<()> {
        let mut r = ptrace::getregs(self.pid).map_err(|e| backend_err("getregs", e))?;
        r.rip = regs.pc();
        r.rsp = regs.sp();
        r.rbp = regs.fp();
        let get = |name: &str, cur: u64| regs.get(name).unwrap_or(cur);
        r.rax = get("rax", r.rax);
        r.rbx = get("rbx", r.rbx);
        r.rcx = get("rcx", r.rcx);
        r.rdx = get("rdx", r.rdx);
        r.rsi = get("rsi", r.rsi);
        r.rdi = get("rdi", r.rdi);
        r.r8 = get("r8", r.r8);
        r.r9 = get("r9", r.r9);
        r.r10 = get("r10", r.r10);
        r.r11 = get("r11", r.r11);
        r.r12 = get("r12", r.r12);
        r.r13 = get("r13", r.r13);
        r.r14 = get("r14", r.r14);
        r.r15 = get("r15", r.r15);
        r.eflags = get("eflags", r.eflags);
        ptrace::setregs(self.pid, r).map_err(|e| backend_err("setregs", e))
    }

    fn set_hw_slot(&mut self, _slot: usize, _spec: HwSlotSpec) -> Result<()> {
        // DR0-DR3 programming via POKEUSER is not wired up yet
        Err(DebugError::Backend {
            operation: "set_hw_slot",
            reason: "hardware debug registers are not supported by the ptrace backend".into(),
        })
    }

    fn clear_hw_slot(&mut self, _slot: usize) -> Result<()> {
        Err(DebugError::Backend {
            operation: "clear_hw_slot",
            reason: "hardware debug registers are not supported by the ptrace backend".into(),
        })
    }

    fn resume(&mut self) -> Result<RawStopEvent> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            let pc = self.pc()?;
            return Ok(RawStopEvent::Signal {
                tid: self.pid.as_raw() as ThreadId,
                signal: StopSignal::Interrupt,
                pc,
            });
        }
        ptrace::cont(self.pid, None).map_err(|e| backend_err("cont", e))?;
        loop {
            if self.interrupt.swap(false, Ordering::SeqCst) {
                kill(self.pid, Signal::SIGSTOP).map_err(|e| backend_err("interrupt", e))?;
                let status =
                    waitpid(self.pid, None).map_err(|e| backend_err("waitpid", e))?;
                return match status {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => Ok(RawStopEvent::Signal {
                        tid: self.pid.as_raw() as ThreadId,
                        signal: StopSignal::Interrupt,
                        pc: self.pc()?,
                    }),
                    other => self.classify_stop(other),
                };
            }
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))
                .map_err(|e| backend_err("waitpid", e))?
            {
                WaitStatus::StillAlive => std::thread::sleep(Duration::from_millis(1)),
                status => return self.classify_stop(status),
            }
        }
    }

    fn single_step(&mut self, _tid: ThreadId) -> Result<RawStopEvent> {
        self.stepping = true;
        ptrace::step(self.pid, None).map_err(|e| backend_err("step", e))?;
        let status = waitpid(self.pid, None).map_err(|e| backend_err("waitpid", e))?;
        self.classify_stop(status)
    }

    fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn detach(&mut self) -> Result<()> {
        ptrace::detach(self.pid, None).map_err(|e| backend_err("detach", e))?;
        log::info!("ptrace detached from pid {}", self.pid);
        Ok(())
    }
}
