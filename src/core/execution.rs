//! Execution control state machine
//!
//! Orchestrates run/step/stop transitions over the backend, consults the
//! trap store on every raw stop, and forwards classified stop reasons
//! upward. Hook callbacks run on the stop path before any caller-visible
//! stop is emitted; conditional breakpoints whose condition is false are
//! resumed transparently.
//!
//! Failure policy: a backend error during any transition is surfaced
//! verbatim and leaves the machine in `Stopped(Signal(InternalError))`,
//! never silently retried.

use crate::analysis::disasm::{self, MAX_INSN_LEN, TRAP_OPCODE};
use crate::core::breakpoint::{CondOperand, Condition, TrapMatch};
use crate::core::error::{DebugError, Result};
use crate::core::session::{Session, SessionState, StopEvent, StopReason};
use crate::debug::{RawStopEvent, StopSignal, ThreadId};
use crate::instrument::HookVerdict;

/// What handling a raw stop decided.
enum Disposition {
    /// Emit this stop to the caller.
    Surface(StopEvent),
    /// The stop stays invisible; execution resumes.
    Resume,
}

/// Outcome of the restore/step/re-arm sequence at the current pc.
enum StepPast {
    /// No enabled software breakpoint at pc.
    NotOnBreakpoint,
    /// Stepped past the breakpoint; the trap is re-armed.
    Stepped,
    /// The step itself produced a reportable event (fault, watch hit, exit).
    Event(RawStopEvent),
}

impl Session {
    /// Resume the target until the next caller-visible stop.
    ///
    /// If the current pc sits on a software breakpoint the original byte is
    /// restored, stepped over, and the trap re-armed before resuming, so the
    /// breakpoint keeps firing on later passes.
    pub fn resume(&mut self) -> Result<StopEvent> {
        self.ensure_attached("continue")?;
        self.ensure_stopped("continue")?;
        self.last_stop = None;
        loop {
            match self.step_past_breakpoint_at_pc()? {
                StepPast::Event(raw) => match self.handle_raw_stop(raw, true)? {
                    Disposition::Surface(ev) => return Ok(ev),
                    Disposition::Resume => continue,
                },
                StepPast::NotOnBreakpoint | StepPast::Stepped => {}
            }
            let tid = self.current_tid();
            self.set_thread_running(tid);
            let raw = match self.backend.resume() {
                Ok(r) => r,
                Err(e) => return Err(self.internal_stop(e)),
            };
            match self.handle_raw_stop(raw, true)? {
                Disposition::Surface(ev) => return Ok(ev),
                Disposition::Resume => continue,
            }
        }
    }

    /// Advance the current thread by exactly one machine instruction.
    pub fn step_into(&mut self) -> Result<StopEvent> {
        self.ensure_attached("step")?;
        self.ensure_stopped("step")?;
        self.last_stop = None;
        let tid = self.current_tid();
        let raw = match self.step_past_breakpoint_at_pc()? {
            StepPast::Event(raw) => raw,
            StepPast::Stepped => {
                let pc = match self.backend.read_registers(tid) {
                    Ok(r) => r.pc(),
                    Err(e) => return Err(self.internal_stop(e)),
                };
                RawStopEvent::SingleStep { tid, pc }
            }
            StepPast::NotOnBreakpoint => match self.backend.single_step(tid) {
                Ok(r) => r,
                Err(e) => return Err(self.internal_stop(e)),
            },
        };
        match self.handle_raw_stop(raw, false)? {
            Disposition::Surface(ev) => Ok(ev),
            Disposition::Resume => unreachable!("step stops are never transparent"),
        }
    }

    /// Step one instruction, treating a call as a unit: a breakpoint is set
    /// at the return address and execution runs until the callee returns.
    /// A recursive callee passing the same return address in a deeper frame
    /// resumes transparently.
    pub fn step_over(&mut self) -> Result<StopEvent> {
        self.ensure_attached("step_over")?;
        self.ensure_stopped("step_over")?;
        let tid = self.current_tid();
        let regs = match self.backend.read_registers(tid) {
            Ok(r) => r,
            Err(e) => return Err(self.internal_stop(e)),
        };
        let pc = regs.pc();

        let insn = match self.decode_at(pc) {
            Some(insn) => insn,
            None => return self.step_into(),
        };
        if !insn.is_call() {
            return self.step_into();
        }

        let ret_addr = insn.next_address();
        let saved_sp = regs.sp();
        if self.traps.enabled_software_at(ret_addr).is_some() {
            // an existing user breakpoint covers the return address
            return self.resume();
        }
        let bp_id = self.set_internal_breakpoint(ret_addr)?;

        let outcome = loop {
            match self.resume() {
                Err(e) => break Err(e),
                Ok(ev) => {
                    if ev.reason != StopReason::Breakpoint(bp_id) {
                        break Ok((ev, false));
                    }
                    let sp = match self.backend.read_registers(tid) {
                        Ok(r) => r.sp(),
                        Err(e) => break Err(self.internal_stop(e)),
                    };
                    if sp >= saved_sp {
                        break Ok((ev, true));
                    }
                    // deeper recursive frame returning through the same
                    // address; not our stop
                }
            }
        };

        if self.state == SessionState::Attached {
            if let Err(e) = self.clear_breakpoint(bp_id) {
                log::warn!("step_over: failed to remove return breakpoint: {e}");
                self.forget_breakpoint(bp_id);
            }
        } else {
            self.forget_breakpoint(bp_id);
        }

        match outcome {
            Ok((ev, true)) => {
                let ev = StopEvent {
                    tid: ev.tid,
                    reason: StopReason::SingleStep,
                    pc: ev.pc,
                };
                self.set_thread_stopped(ev.tid, ev.reason);
                self.last_stop = Some(ev.clone());
                Ok(ev)
            }
            Ok((ev, false)) => Ok(ev),
            Err(e) => Err(e),
        }
    }

    /// Decode the instruction at `addr`, seeing through our own trap bytes.
    pub(crate) fn decode_at(&mut self, addr: u64) -> Option<disasm::Instruction> {
        let region = self.memory_map.region_at(addr)?;
        let avail = ((region.end() - addr) as usize).min(MAX_INSN_LEN);
        let mut window = vec![0u8; avail];
        self.backend.read_memory(addr, &mut window).ok()?;
        if window[0] == TRAP_OPCODE {
            if let Some(id) = self.traps.enabled_software_at(addr) {
                if let Some(orig) = self.traps.breakpoint(id).and_then(|b| b.saved_byte) {
                    window[0] = orig;
                }
            }
        }
        disasm::decode(&window, addr).ok()
    }

    /// Restore/step/re-arm for an enabled software breakpoint at the
    /// current pc. The sequence is atomic with respect to other session
    /// operations: it runs entirely under the session's exclusive access,
    /// and the trap is re-armed before any event is surfaced.
    fn step_past_breakpoint_at_pc(&mut self) -> Result<StepPast> {
        let tid = self.current_tid();
        let pc = match self.backend.read_registers(tid) {
            Ok(r) => r.pc(),
            Err(e) => return Err(self.internal_stop(e)),
        };
        let Some(id) = self.traps.enabled_software_at(pc) else {
            return Ok(StepPast::NotOnBreakpoint);
        };
        let orig = self
            .traps
            .breakpoint(id)
            .and_then(|b| b.saved_byte)
            .ok_or(DebugError::Backend {
                operation: "step_past_breakpoint",
                reason: "breakpoint record has no saved byte".into(),
            })?;

        if let Err(e) = self.backend.write_memory(pc, &[orig]) {
            return Err(self.internal_stop(e));
        }
        let raw = match self.backend.single_step(tid) {
            Ok(r) => r,
            Err(e) => {
                // best effort to leave the trap armed before reporting
                let _ = self.backend.write_memory(pc, &[TRAP_OPCODE]);
                return Err(self.internal_stop(e));
            }
        };
        if !matches!(raw, RawStopEvent::Exited { .. }) {
            if let Err(e) = self.backend.write_memory(pc, &[TRAP_OPCODE]) {
                return Err(self.internal_stop(e));
            }
        }
        match raw {
            RawStopEvent::SingleStep { .. } => Ok(StepPast::Stepped),
            other => Ok(StepPast::Event(other)),
        }
    }

    /// Classify a raw backend stop. `transparent_allowed` is true on the
    /// resume path, where condition-suppressed stops and hook-requested
    /// resumes stay invisible to the caller.
    fn handle_raw_stop(&mut self, raw: RawStopEvent, transparent_allowed: bool) -> Result<Disposition> {
        match raw {
            RawStopEvent::Exited { code } => {
                let tid = self.current_tid();
                self.set_thread_exited(tid);
                self.state = SessionState::Terminated;
                let ev = StopEvent {
                    tid,
                    reason: StopReason::Exit(code),
                    pc: 0,
                };
                self.last_stop = Some(ev.clone());
                log::info!("target exited with code {code}");
                Ok(Disposition::Surface(ev))
            }
            RawStopEvent::Trap { tid, pc } | RawStopEvent::HwSlot { tid, pc, .. } => {
                let matched = self.traps.on_stop(&raw);
                match matched {
                    Some(TrapMatch::Breakpoint(id)) => {
                        self.handle_breakpoint_hit(id, tid, pc, transparent_allowed)
                    }
                    Some(TrapMatch::Watchpoint(id)) => {
                        if let Some(wp) = self.traps.watchpoint_mut(id) {
                            wp.hit_count += 1;
                        }
                        self.surface(tid, StopReason::Watchpoint(id), pc, transparent_allowed)
                    }
                    // a trap we did not install
                    None => self.surface(
                        tid,
                        StopReason::Signal(StopSignal::Os(5)),
                        pc,
                        transparent_allowed,
                    ),
                }
            }
            RawStopEvent::SingleStep { tid, pc } => {
                self.surface(tid, StopReason::SingleStep, pc, transparent_allowed)
            }
            RawStopEvent::Signal { tid, signal, pc } => {
                self.surface(tid, StopReason::Signal(signal), pc, transparent_allowed)
            }
            RawStopEvent::Fault {
                tid,
                pc,
                kind,
                address,
            } => {
                self.last_fault = Some(crate::core::session::LiveFault {
                    kind,
                    address,
                    pc,
                    tid,
                });
                log::warn!("unhandled fault {kind} at pc {pc:#x}, address {address:#x}");
                // never transparently resumed: resuming would re-fault
                let ev = StopEvent {
                    tid,
                    reason: StopReason::Signal(StopSignal::Fault(kind)),
                    pc,
                };
                self.set_thread_stopped(tid, ev.reason);
                self.run_hooks(tid, pc)?;
                self.last_stop = Some(ev.clone());
                Ok(Disposition::Surface(ev))
            }
        }
    }

    fn handle_breakpoint_hit(
        &mut self,
        id: u32,
        tid: ThreadId,
        pc: u64,
        transparent_allowed: bool,
    ) -> Result<Disposition> {
        let Some(bp) = self.traps.breakpoint_mut(id) else {
            // record vanished between match and handling; report the raw trap
            return self.surface(
                tid,
                StopReason::Signal(StopSignal::Os(5)),
                pc,
                transparent_allowed,
            );
        };
        bp.hit_count += 1;
        let (condition, one_shot) = (bp.condition.clone(), bp.one_shot);

        if let Some(cond) = condition {
            let holds = match self.eval_condition(&cond, tid) {
                Ok(h) => h,
                Err(e) => return Err(self.internal_stop(e)),
            };
            // hit_count was bumped above for diagnostics either way
            if !holds && transparent_allowed {
                self.set_thread_stopped(tid, StopReason::Signal(StopSignal::Stop));
                log::trace!("breakpoint {id} condition false, resuming transparently");
                return Ok(Disposition::Resume);
            }
        }

        if one_shot {
            self.clear_breakpoint(id)?;
        }

        self.surface(tid, StopReason::Breakpoint(id), pc, transparent_allowed)
    }

    /// Mark the thread stopped, run matching hooks, then emit the stop.
    /// Hook execution happens-before the stop is visible to the caller.
    fn surface(
        &mut self,
        tid: ThreadId,
        reason: StopReason,
        pc: u64,
        transparent_allowed: bool,
    ) -> Result<Disposition> {
        self.set_thread_stopped(tid, reason);
        let verdict = self.run_hooks(tid, pc)?;
        if verdict == HookVerdict::Resume && transparent_allowed {
            log::trace!("hook requested transparent resume at {pc:#x}");
            return Ok(Disposition::Resume);
        }
        let ev = StopEvent { tid, reason, pc };
        self.last_stop = Some(ev.clone());
        Ok(Disposition::Surface(ev))
    }

    fn run_hooks(&mut self, tid: ThreadId, pc: u64) -> Result<HookVerdict> {
        if !self.instrumentation.has_hooks_at(pc) {
            return Ok(HookVerdict::Stay);
        }
        let regs = self.backend.read_registers(tid)?;
        self.instrumentation.dispatch(tid, pc, &regs)
    }

    fn eval_condition(&mut self, cond: &Condition, tid: ThreadId) -> Result<bool> {
        let lhs = match &cond.lhs {
            CondOperand::Register(name) => {
                self.backend.read_registers(tid)?.get(name).unwrap_or(0)
            }
            CondOperand::Memory(addr) => self.backend_read_u64(*addr)?,
        };
        Ok(cond.holds(lhs))
    }

    /// Record the internal-error stop state and hand the cause back.
    fn internal_stop(&mut self, e: DebugError) -> DebugError {
        let tid = self.current_tid();
        let reason = StopReason::Signal(StopSignal::InternalError);
        self.set_thread_stopped(tid, reason);
        self.last_stop = Some(StopEvent { tid, reason, pc: 0 });
        log::error!("backend failure during transition: {e}");
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::disasm::Op;
    use crate::core::breakpoint::BreakpointKind;
    use crate::core::memory::MemoryRegion;
    use crate::core::registers::RegisterSet;
    use crate::debug::sim::{SimTarget, CODE_BASE, DATA_BASE};
    use crate::debug::{HwSlotSpec, TargetBackend, WatchAccess};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    fn session(ops: &[Op]) -> Session {
        Session::attach(Box::new(SimTarget::with_program(ops))).unwrap()
    }

    /// Delegates to the simulator, failing selected operations on demand.
    struct FlakySim {
        inner: SimTarget,
        fail_writes: Arc<AtomicBool>,
        /// Register reads fail while the target sits at this pc (0 = never).
        fail_reads_at: Arc<AtomicU64>,
    }

    impl TargetBackend for FlakySim {
        fn pid(&self) -> u32 {
            self.inner.pid()
        }
        fn memory_map(&mut self) -> Result<Vec<MemoryRegion>> {
            self.inner.memory_map()
        }
        fn threads(&mut self) -> Result<Vec<ThreadId>> {
            self.inner.threads()
        }
        fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read_memory(addr, buf)
        }
        fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DebugError::Backend {
                    operation: "write_memory",
                    reason: "target memory unavailable".into(),
                });
            }
            self.inner.write_memory(addr, data)
        }
        fn read_registers(&mut self, tid: ThreadId) -> Result<RegisterSet> {
            let regs = self.inner.read_registers(tid)?;
            let poisoned = self.fail_reads_at.load(Ordering::SeqCst);
            if poisoned != 0 && regs.pc() == poisoned {
                return Err(DebugError::Backend {
                    operation: "read_registers",
                    reason: "register file unavailable".into(),
                });
            }
            Ok(regs)
        }
        fn write_registers(&mut self, tid: ThreadId, regs: &RegisterSet) -> Result<()> {
            self.inner.write_registers(tid, regs)
        }
        fn set_hw_slot(&mut self, slot: usize, spec: HwSlotSpec) -> Result<()> {
            self.inner.set_hw_slot(slot, spec)
        }
        fn clear_hw_slot(&mut self, slot: usize) -> Result<()> {
            self.inner.clear_hw_slot(slot)
        }
        fn resume(&mut self) -> Result<RawStopEvent> {
            self.inner.resume()
        }
        fn single_step(&mut self, tid: ThreadId) -> Result<RawStopEvent> {
            self.inner.single_step(tid)
        }
        fn interrupt_flag(&self) -> Arc<AtomicBool> {
            self.inner.interrupt_flag()
        }
        fn detach(&mut self) -> Result<()> {
            self.inner.detach()
        }
    }

    #[test]
    fn resume_without_traps_runs_to_exit() {
        let mut s = session(&[Op::MovImm { dst: 0, imm: 0 }, Op::Halt]);
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Exit(0));
        assert_eq!(s.state(), SessionState::Terminated);
    }

    #[test]
    fn resume_while_terminated_is_a_state_violation() {
        let mut s = session(&[Op::Halt]);
        s.resume().unwrap();
        assert!(matches!(
            s.resume(),
            Err(DebugError::StateViolation { .. })
        ));
    }

    #[test]
    fn breakpoint_fires_and_refires_after_continue() {
        // loop body runs twice: r1 counts down from 2
        let body = CODE_BASE + 10; // after movi
        let mut s = session(&[
            Op::MovImm { dst: 1, imm: 2 },
            Op::MovImm { dst: 2, imm: 1 }, // body start (address body)
            Op::Sub { dst: 1, src: 2 },
            Op::Bnz {
                cond: 1,
                target: body,
            },
            Op::Halt,
        ]);
        let id = s
            .set_breakpoint(body, BreakpointKind::Software, None)
            .unwrap();

        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Breakpoint(id));
        assert_eq!(ev.pc, body);

        // re-arm invariant: the same breakpoint fires on the second pass
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Breakpoint(id));
        assert_eq!(s.traps().breakpoint(id).unwrap().hit_count, 2);

        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Exit(0));
    }

    #[test]
    fn step_into_advances_one_decoded_instruction() {
        let mut s = session(&[Op::MovImm { dst: 0, imm: 9 }, Op::Nop, Op::Halt]);
        let ev = s.step_into().unwrap();
        assert_eq!(ev.reason, StopReason::SingleStep);
        assert_eq!(ev.pc, CODE_BASE + 10); // movi is 10 bytes
        let ev = s.step_into().unwrap();
        assert_eq!(ev.pc, CODE_BASE + 11); // nop is 1 byte
    }

    #[test]
    fn step_over_skips_callee() {
        // call f; halt; f: enter; leave; ret
        let f = CODE_BASE + 10;
        let mut s = session(&[
            Op::Call { target: f },
            Op::Halt,
            Op::Enter,
            Op::Leave,
            Op::Ret,
        ]);
        let ev = s.step_over().unwrap();
        assert_eq!(ev.reason, StopReason::SingleStep);
        assert_eq!(ev.pc, CODE_BASE + 9); // at the halt, past the whole call
        // the internal return breakpoint is gone
        assert_eq!(s.traps().breakpoints().count(), 0);
    }

    #[test]
    fn step_over_surfaces_user_breakpoint_inside_callee() {
        let f = CODE_BASE + 10;
        let mut s = session(&[
            Op::Call { target: f },
            Op::Halt,
            Op::Enter,
            Op::Leave,
            Op::Ret,
        ]);
        let id = s.set_breakpoint(f, BreakpointKind::Software, None).unwrap();
        let ev = s.step_over().unwrap();
        assert_eq!(ev.reason, StopReason::Breakpoint(id));
        assert_eq!(s.traps().breakpoints().count(), 1);
    }

    #[test]
    fn conditional_breakpoint_resumes_until_condition_holds() {
        // r1 counts 3, 2, 1; break at the bnz with condition r1 == 1
        let body = CODE_BASE + 10;
        let bnz_addr = body + 10 + 3; // movi(10) at body, sub(3)
        let mut s = session(&[
            Op::MovImm { dst: 1, imm: 3 },
            Op::MovImm { dst: 2, imm: 1 },
            Op::Sub { dst: 1, src: 2 },
            Op::Bnz {
                cond: 1,
                target: body,
            },
            Op::Halt,
        ]);
        let cond: Condition = "r1 == 1".parse().unwrap();
        let id = s
            .set_breakpoint(bnz_addr, BreakpointKind::Software, Some(cond))
            .unwrap();
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Breakpoint(id));
        let regs = s.registers_current().unwrap();
        assert_eq!(regs.get("r1"), Some(1));
        // suppressed hits still counted for diagnostics
        assert_eq!(s.traps().breakpoint(id).unwrap().hit_count, 2);
    }

    #[test]
    fn hardware_breakpoint_fires_without_patching_code() {
        let mut s = session(&[Op::Nop, Op::Nop, Op::Halt]);
        let id = s
            .set_breakpoint(CODE_BASE + 1, BreakpointKind::Hardware, None)
            .unwrap();
        // code bytes untouched
        assert_eq!(s.read_memory(CODE_BASE + 1, 1).unwrap(), vec![0x01]);
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Breakpoint(id));
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Exit(0));
    }

    #[test]
    fn watchpoint_reports_write_access() {
        let mut s = session(&[
            Op::MovImm { dst: 0, imm: 1 },
            Op::Store {
                addr: DATA_BASE + 0x10,
                src: 0,
            },
            Op::Halt,
        ]);
        let id = s
            .set_watchpoint(DATA_BASE + 0x10, 8, WatchAccess::Write)
            .unwrap();
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Watchpoint(id));
        assert_eq!(s.traps().watchpoint(id).unwrap().hit_count, 1);
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Exit(1));
    }

    #[test]
    fn interrupt_cancels_infinite_resume() {
        let mut target = SimTarget::with_program(&[Op::Jmp { target: CODE_BASE }]);
        target.auto_interrupt_after(1000);
        let mut s = Session::attach(Box::new(target)).unwrap();
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Signal(StopSignal::Interrupt));
        // session is still attached and usable
        assert_eq!(s.state(), SessionState::Attached);
        assert!(s.registers_current().is_ok());
    }

    #[test]
    fn interrupt_flag_checked_before_running() {
        let mut s = session(&[Op::Jmp { target: CODE_BASE }]);
        s.interrupt();
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Signal(StopSignal::Interrupt));
    }

    #[test]
    fn fault_stop_records_live_fault() {
        let mut s = session(&[Op::Load {
            dst: 0,
            addr: 0x4141_4141,
        }]);
        let ev = s.resume().unwrap();
        assert!(matches!(
            ev.reason,
            StopReason::Signal(StopSignal::Fault(crate::debug::FaultKind::Segfault))
        ));
        let fault = s.last_fault().unwrap();
        assert_eq!(fault.address, 0x4141_4141);
        assert_eq!(fault.pc, CODE_BASE);
    }

    #[test]
    fn write_failure_during_restore_marks_internal_stop() {
        let fail_writes = Arc::new(AtomicBool::new(false));
        let target = FlakySim {
            inner: SimTarget::with_program(&[Op::Nop, Op::Nop, Op::Halt]),
            fail_writes: Arc::clone(&fail_writes),
            fail_reads_at: Arc::new(AtomicU64::new(0)),
        };
        let mut s = Session::attach(Box::new(target)).unwrap();
        let id = s
            .set_breakpoint(CODE_BASE + 1, BreakpointKind::Software, None)
            .unwrap();
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Breakpoint(id));

        // the restore write of the step-past sequence fails
        fail_writes.store(true, Ordering::SeqCst);
        let err = s.resume().unwrap_err();
        assert!(matches!(err, DebugError::Backend { .. }));
        assert_eq!(
            s.last_stop().unwrap().reason,
            StopReason::Signal(StopSignal::InternalError)
        );
        // the session stays usable once the backend recovers
        fail_writes.store(false, Ordering::SeqCst);
        assert!(s.registers_current().is_ok());
    }

    #[test]
    fn register_read_failure_during_condition_eval_marks_internal_stop() {
        let fail_reads_at = Arc::new(AtomicU64::new(0));
        let target = FlakySim {
            inner: SimTarget::with_program(&[Op::Nop, Op::Nop, Op::Halt]),
            fail_writes: Arc::new(AtomicBool::new(false)),
            fail_reads_at: Arc::clone(&fail_reads_at),
        };
        let mut s = Session::attach(Box::new(target)).unwrap();
        let cond: Condition = "r0 == 1".parse().unwrap();
        let id = s
            .set_breakpoint(CODE_BASE + 1, BreakpointKind::Software, Some(cond))
            .unwrap();

        // register reads fail once the target sits on the breakpoint
        fail_reads_at.store(CODE_BASE + 1, Ordering::SeqCst);
        let err = s.resume().unwrap_err();
        assert!(matches!(err, DebugError::Backend { .. }));
        assert_eq!(
            s.last_stop().unwrap().reason,
            StopReason::Signal(StopSignal::InternalError)
        );
        assert_eq!(s.traps().breakpoint(id).unwrap().hit_count, 1);
    }

    #[test]
    fn one_shot_breakpoint_fires_once() {
        let body = CODE_BASE + 10;
        let mut s = session(&[
            Op::MovImm { dst: 1, imm: 2 },
            Op::MovImm { dst: 2, imm: 1 },
            Op::Sub { dst: 1, src: 2 },
            Op::Bnz {
                cond: 1,
                target: body,
            },
            Op::Halt,
        ]);
        let id = s
            .set_one_shot_breakpoint(body, BreakpointKind::Software)
            .unwrap();
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Breakpoint(id));
        // removed after the hit: second pass runs through
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Exit(0));
    }
}
