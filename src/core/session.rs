//! Debug session
//!
//! A [`Session`] owns exactly one attached target and everything installed
//! into it: threads, breakpoints, watchpoints, and hooks. There is no
//! ambient "current debugger" state anywhere in the crate; every operation
//! takes an explicit session handle, and all mutation is serialized through
//! `&mut Session`, which is the per-session exclusive lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::analysis::unwind::SymbolMap;
use crate::core::breakpoint::{TrapId, TrapStore};
use crate::core::error::{DebugError, Result};
use crate::core::memory::MemoryMap;
use crate::core::registers::RegisterSet;
use crate::debug::{FaultKind, StopSignal, TargetBackend, ThreadId};
use crate::instrument::InstrumentationEngine;

/// Session lifecycle. `Detached` exists only transiently: a session value
/// is created by [`Session::attach`] already in `Attached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Detached,
    Attached,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Detached => write!(f, "detached"),
            SessionState::Attached => write!(f, "attached"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why a thread stopped, as surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint(TrapId),
    Watchpoint(TrapId),
    SingleStep,
    Signal(StopSignal),
    Exit(i64),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Breakpoint(id) => write!(f, "breakpoint {id}"),
            StopReason::Watchpoint(id) => write!(f, "watchpoint {id}"),
            StopReason::SingleStep => write!(f, "single step"),
            StopReason::Signal(s) => write!(f, "{s}"),
            StopReason::Exit(code) => write!(f, "exit {code}"),
        }
    }
}

/// A caller-visible stop notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopEvent {
    pub tid: ThreadId,
    pub reason: StopReason,
    pub pc: u64,
}

/// Per-thread run state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped(StopReason),
    Exited,
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub tid: ThreadId,
    pub run_state: RunState,
}

/// The unhandled fault behind the most recent fault stop, kept for the
/// crash analyzer's live path.
#[derive(Debug, Clone, Copy)]
pub struct LiveFault {
    pub kind: FaultKind,
    pub address: u64,
    pub pc: u64,
    pub tid: ThreadId,
}

/// Cancellation handle usable from another context while a blocking
/// operation is in flight. Raising it is the only asynchronous operation
/// the session permits.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// One attached target and everything installed into it.
pub struct Session {
    pub(crate) backend: Box<dyn TargetBackend>,
    pub(crate) state: SessionState,
    pid: u32,
    pub(crate) memory_map: MemoryMap,
    pub(crate) threads: BTreeMap<ThreadId, Thread>,
    pub(crate) current_tid: ThreadId,
    pub(crate) traps: TrapStore,
    pub(crate) instrumentation: InstrumentationEngine,
    pub(crate) interrupt: Arc<AtomicBool>,
    pub(crate) last_stop: Option<StopEvent>,
    pub(crate) last_fault: Option<LiveFault>,
    symbols: SymbolMap,
}

impl Session {
    /// Attach to a target. Snapshots the initial memory map and thread set;
    /// every thread starts out stopped.
    pub fn attach(mut backend: Box<dyn TargetBackend>) -> Result<Self> {
        let pid = backend.pid();
        let regions = backend.memory_map()?;
        let tids = backend.threads()?;
        if tids.is_empty() {
            return Err(DebugError::TargetUnreachable {
                pid,
                reason: "target reported no threads".into(),
            });
        }
        let current_tid = tids[0];
        let threads = tids
            .into_iter()
            .map(|tid| {
                (
                    tid,
                    Thread {
                        tid,
                        run_state: RunState::Stopped(StopReason::Signal(StopSignal::Stop)),
                    },
                )
            })
            .collect();
        let interrupt = backend.interrupt_flag();
        log::info!("attached to target pid {pid}");
        Ok(Session {
            backend,
            state: SessionState::Attached,
            pid,
            memory_map: MemoryMap::new(regions),
            threads,
            current_tid,
            traps: TrapStore::new(),
            instrumentation: InstrumentationEngine::new(),
            interrupt,
            last_stop: None,
            last_fault: None,
            symbols: SymbolMap::new(),
        })
    }

    /// Detach from the target. Transactionally removes every installed trap
    /// from the live target before the session goes `Terminated`, so a
    /// process that keeps running afterwards carries no dangling traps.
    pub fn detach(&mut self) -> Result<()> {
        self.ensure_attached("detach")?;

        let bp_ids: Vec<TrapId> = self.traps.breakpoints().map(|b| b.id).collect();
        let wp_ids: Vec<TrapId> = self.traps.watchpoints().map(|w| w.id).collect();
        let mut first_err = None;
        for id in bp_ids {
            match self.clear_breakpoint(id) {
                Ok(()) => {}
                Err(e) => {
                    log::warn!("detach: failed to remove breakpoint {id}: {e}");
                    first_err.get_or_insert(e);
                    self.forget_breakpoint(id);
                }
            }
        }
        for id in wp_ids {
            if let Err(e) = self.clear_watchpoint(id) {
                log::warn!("detach: failed to remove watchpoint {id}: {e}");
                first_err.get_or_insert(e);
            }
        }
        // hooks and taint labels do not outlive the session
        self.instrumentation.clear();

        let detach_res = self.backend.detach();
        self.state = SessionState::Terminated;
        log::info!("detached from target pid {}", self.pid);
        match first_err {
            Some(e) => Err(e),
            None => detach_res,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.memory_map
    }

    /// Re-query the target's mapping. Called after events that can change
    /// it (module load/unload).
    pub fn refresh_memory_map(&mut self) -> Result<()> {
        self.ensure_attached("refresh_memory_map")?;
        let regions = self.backend.memory_map()?;
        self.memory_map = MemoryMap::new(regions);
        Ok(())
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn current_tid(&self) -> ThreadId {
        self.current_tid
    }

    pub fn last_stop(&self) -> Option<&StopEvent> {
        self.last_stop.as_ref()
    }

    pub fn last_fault(&self) -> Option<LiveFault> {
        self.last_fault
    }

    /// Symbol name covering `addr`, if one was defined.
    pub fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }

    pub fn define_symbol(&mut self, name: &str, low: u64, high: u64) {
        self.symbols.define(name, low, high);
    }

    pub(crate) fn ensure_attached(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SessionState::Attached => Ok(()),
            other => Err(DebugError::StateViolation {
                operation,
                state: other.to_string(),
            }),
        }
    }

    /// Memory and register operations are only valid against a stopped
    /// thread; against a running one they fail instead of corrupting state.
    pub(crate) fn ensure_stopped(&self, operation: &'static str) -> Result<()> {
        match self.threads.get(&self.current_tid).map(|t| &t.run_state) {
            Some(RunState::Stopped(_)) => Ok(()),
            Some(RunState::Running) => Err(DebugError::StateViolation {
                operation,
                state: "running".into(),
            }),
            _ => Err(DebugError::StateViolation {
                operation,
                state: "exited".into(),
            }),
        }
    }

    pub fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_attached("read_memory")?;
        self.ensure_stopped("read_memory")?;
        if !self.memory_map.contains_range(address, len as u64) {
            return Err(DebugError::InvalidAddress { address });
        }
        let mut buf = vec![0u8; len];
        self.backend.read_memory(address, &mut buf)?;
        Ok(buf)
    }

    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.ensure_attached("write_memory")?;
        self.ensure_stopped("write_memory")?;
        if !self.memory_map.contains_range(address, data.len() as u64) {
            return Err(DebugError::InvalidAddress { address });
        }
        self.backend.write_memory(address, data)
    }

    pub fn read_u64(&mut self, address: u64) -> Result<u64> {
        let bytes = self.read_memory(address, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn registers(&mut self, tid: ThreadId) -> Result<RegisterSet> {
        self.ensure_attached("get_registers")?;
        self.ensure_stopped("get_registers")?;
        self.backend.read_registers(tid)
    }

    pub fn set_registers(&mut self, tid: ThreadId, regs: &RegisterSet) -> Result<()> {
        self.ensure_attached("set_registers")?;
        self.ensure_stopped("set_registers")?;
        self.backend.write_registers(tid, regs)
    }

    pub fn registers_current(&mut self) -> Result<RegisterSet> {
        let tid = self.current_tid;
        self.registers(tid)
    }

    /// The pending stop event. The blocking transitions (`resume`, the step
    /// operations) return their stop directly; this reports the most recent
    /// one for callers that polled separately.
    pub fn wait_for_stop(&self) -> Result<StopEvent> {
        match &self.last_stop {
            Some(ev) => Ok(ev.clone()),
            None => {
                let thread = self.threads.get(&self.current_tid);
                match thread.map(|t| &t.run_state) {
                    Some(RunState::Stopped(reason)) => Ok(StopEvent {
                        tid: self.current_tid,
                        reason: *reason,
                        pc: 0,
                    }),
                    _ => Err(DebugError::StateViolation {
                        operation: "wait_for_stop",
                        state: "no stop pending".into(),
                    }),
                }
            }
        }
    }

    /// Request cancellation of the in-flight or next blocking transition.
    pub fn interrupt(&mut self) {
        log::debug!("interrupt requested for pid {}", self.pid);
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Handle for raising the interrupt from another context.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.interrupt),
        }
    }

    pub(crate) fn set_thread_stopped(&mut self, tid: ThreadId, reason: StopReason) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.run_state = RunState::Stopped(reason);
        }
    }

    pub(crate) fn set_thread_running(&mut self, tid: ThreadId) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.run_state = RunState::Running;
        }
    }

    pub(crate) fn set_thread_exited(&mut self, tid: ThreadId) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.run_state = RunState::Exited;
        }
    }

    /// Backend register/memory reads used while a stop is being classified,
    /// before the thread has been re-marked as stopped.
    pub(crate) fn backend_read_u64(&mut self, address: u64) -> Result<u64> {
        if !self.memory_map.contains_range(address, 8) {
            return Err(DebugError::InvalidAddress { address });
        }
        let mut buf = [0u8; 8];
        self.backend.read_memory(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::disasm::Op;
    use crate::debug::sim::{SimTarget, CODE_BASE, DATA_BASE};

    fn session(ops: &[Op]) -> Session {
        Session::attach(Box::new(SimTarget::with_program(ops))).unwrap()
    }

    #[test]
    fn attach_snapshots_memory_map_and_threads() {
        let s = session(&[Op::Halt]);
        assert_eq!(s.state(), SessionState::Attached);
        assert!(s.memory_map().contains(CODE_BASE));
        assert!(s.memory_map().contains(DATA_BASE));
        assert_eq!(s.threads().count(), 1);
    }

    #[test]
    fn memory_ops_validate_addresses() {
        let mut s = session(&[Op::Halt]);
        assert!(s.read_memory(CODE_BASE, 16).is_ok());
        assert!(matches!(
            s.read_memory(0xdead_0000, 4),
            Err(DebugError::InvalidAddress { .. })
        ));
        assert!(matches!(
            s.write_memory(0xdead_0000, &[1]),
            Err(DebugError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn terminated_session_rejects_operations() {
        let mut s = session(&[Op::Halt]);
        s.detach().unwrap();
        assert_eq!(s.state(), SessionState::Terminated);
        let err = s.read_memory(CODE_BASE, 1).unwrap_err();
        assert!(matches!(err, DebugError::StateViolation { .. }));
        let err = s.detach().unwrap_err();
        assert!(matches!(err, DebugError::StateViolation { .. }));
    }

    #[test]
    fn detach_removes_installed_traps_from_target() {
        let mut s = session(&[Op::Nop, Op::Halt]);
        s.set_breakpoint(CODE_BASE, crate::core::breakpoint::BreakpointKind::Software, None)
            .unwrap();
        assert_eq!(
            s.read_memory(CODE_BASE, 1).unwrap(),
            vec![crate::analysis::disasm::TRAP_OPCODE]
        );
        s.detach().unwrap();
        assert_eq!(s.traps().breakpoints().count(), 0);
    }

    #[test]
    fn wait_for_stop_reports_the_pending_event() {
        let mut s = session(&[Op::Nop, Op::Halt]);
        let ev = s.step_into().unwrap();
        assert_eq!(s.wait_for_stop().unwrap(), ev);
    }
}
