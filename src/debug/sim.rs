//! Simulated target
//!
//! In-process interpreter for the reference ISA. Fully deterministic: the
//! same program and the same command sequence always produce the same stop
//! events, which is what the integration tests and the crash-analysis
//! determinism guarantees are built on.
//!
//! The simulator is a *target*, not a debugger: it reports raw stops (trap
//! opcode reached, debug slot fired, fault, exit) and leaves every policy
//! decision to the layers above, exactly like the ptrace backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::analysis::disasm::{self, Op, MAX_INSN_LEN, TRAP_OPCODE};
use crate::core::error::{DebugError, Result};
use crate::core::memory::{MemoryRegion, Protection};
use crate::core::registers::RegisterSet;
use crate::debug::{
    FaultKind, HwSlotSpec, RawStopEvent, StopSignal, TargetBackend, ThreadId, HW_SLOT_COUNT,
};

/// The simulator runs a single thread.
pub const SIM_TID: ThreadId = 1;

/// Default load address for code in [`SimTarget::with_program`].
pub const CODE_BASE: u64 = 0x1000;
/// Default read-write data region base.
pub const DATA_BASE: u64 = 0x5000;
/// Default stack region base.
pub const STACK_BASE: u64 = 0x7000_0000;
const STACK_LEN: u64 = 0x1000;
const CODE_LEN: u64 = 0x1000;
const DATA_LEN: u64 = 0x1000;

/// Deterministic in-process target machine.
pub struct SimTarget {
    regions: Vec<(MemoryRegion, Vec<u8>)>,
    regs: RegisterSet,
    hw_slots: [Option<HwSlotSpec>; HW_SLOT_COUNT],
    interrupt: Arc<AtomicBool>,
    exited: Option<i64>,
    /// Slot that already fired at this pc; skipped once so resume can make
    /// progress past the instruction that triggered it.
    suppressed: Option<(usize, u64)>,
    /// Raise the interrupt flag after this many executed instructions.
    /// Stands in for a controlling context issuing a timeout.
    auto_interrupt_after: Option<u64>,
    executed: u64,
}

impl SimTarget {
    pub fn new() -> Self {
        let mut regs = RegisterSet::new();
        regs.set_pc(0);
        regs.set_sp(0);
        regs.set_fp(0);
        for i in 0..8u8 {
            regs.set(disasm::reg_name(i), 0);
        }
        Self {
            regions: Vec::new(),
            regs,
            hw_slots: [None; HW_SLOT_COUNT],
            interrupt: Arc::new(AtomicBool::new(false)),
            exited: None,
            suppressed: None,
            auto_interrupt_after: None,
            executed: 0,
        }
    }

    /// Standard test machine: code at [`CODE_BASE`] (rx), data at
    /// [`DATA_BASE`] (rw), a non-executable stack, pc at the entry point.
    pub fn with_program(ops: &[Op]) -> Self {
        let mut t = Self::new();
        t.map_region(CODE_BASE, CODE_LEN, Protection::RX, Some("[code]"));
        t.map_region(DATA_BASE, DATA_LEN, Protection::RW, Some("[heap]"));
        t.map_region(STACK_BASE, STACK_LEN, Protection::RW, Some("[stack]"));
        t.load(CODE_BASE, &disasm::assemble(ops));
        t.regs.set_pc(CODE_BASE);
        t.regs.set_sp(STACK_BASE + STACK_LEN);
        t.regs.set_fp(0);
        t
    }

    pub fn map_region(&mut self, base: u64, len: u64, protection: Protection, name: Option<&str>) {
        let region = MemoryRegion {
            base,
            len,
            protection,
            name: name.map(str::to_string),
        };
        self.regions.push((region, vec![0u8; len as usize]));
        self.regions.sort_by_key(|(r, _)| r.base);
    }

    /// Write raw bytes into mapped memory, ignoring protection (loader path).
    pub fn load(&mut self, addr: u64, bytes: &[u8]) {
        self.write_raw(addr, bytes)
            .expect("load target of sim program must be mapped");
    }

    pub fn set_register(&mut self, name: &str, value: u64) {
        self.regs.set(name, value);
    }

    /// Simulate a long-running target that the controller interrupts after
    /// `n` instructions.
    pub fn auto_interrupt_after(&mut self, n: u64) {
        self.auto_interrupt_after = Some(n);
    }

    fn region_for(&self, addr: u64, len: u64) -> Option<usize> {
        self.regions
            .iter()
            .position(|(r, _)| r.contains_range(addr, len))
    }

    fn read_raw(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let idx = self
            .region_for(addr, buf.len() as u64)
            .ok_or(DebugError::InvalidAddress { address: addr })?;
        let (region, data) = &self.regions[idx];
        let off = (addr - region.base) as usize;
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write_raw(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let idx = self
            .region_for(addr, bytes.len() as u64)
            .ok_or(DebugError::InvalidAddress { address: addr })?;
        let (region, data) = &mut self.regions[idx];
        let off = (addr - region.base) as usize;
        data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_u64_checked(&self, addr: u64, fault_pc: u64) -> std::result::Result<u64, RawStopEvent> {
        let mut buf = [0u8; 8];
        match self.region_for(addr, 8) {
            Some(idx) if self.regions[idx].0.protection.read => {
                self.read_raw(addr, &mut buf).ok();
                Ok(u64::from_le_bytes(buf))
            }
            _ => Err(self.fault(fault_pc, FaultKind::Segfault, addr)),
        }
    }

    fn write_u64_checked(
        &mut self,
        addr: u64,
        value: u64,
        fault_pc: u64,
    ) -> std::result::Result<(), RawStopEvent> {
        match self.region_for(addr, 8) {
            Some(idx) if self.regions[idx].0.protection.write => {
                self.write_raw(addr, &value.to_le_bytes()).ok();
                Ok(())
            }
            _ => Err(self.fault(fault_pc, FaultKind::Segfault, addr)),
        }
    }

    fn fault(&self, pc: u64, kind: FaultKind, address: u64) -> RawStopEvent {
        RawStopEvent::Fault {
            tid: SIM_TID,
            pc,
            kind,
            address,
        }
    }

    fn matching_watch_slot(&self, addr: u64, len: u64, is_write: bool) -> Option<(usize, u64)> {
        for (i, slot) in self.hw_slots.iter().enumerate() {
            if let Some(HwSlotSpec::Access {
                address: wa,
                len: wl,
                access,
            }) = slot
            {
                let overlaps = addr < wa + wl && *wa < addr + len;
                if overlaps && access.matches_write(is_write) {
                    return Some((i, addr));
                }
            }
        }
        None
    }

    /// Execute at most one instruction. `None` means the instruction retired
    /// normally; `Some` is a stop the caller must surface.
    fn exec_one(&mut self) -> Option<RawStopEvent> {
        if let Some(code) = self.exited {
            return Some(RawStopEvent::Exited { code });
        }
        let pc = self.regs.pc();
        let skip = self.suppressed.take();

        // hardware execute slots fire before the fetch
        for (i, slot) in self.hw_slots.iter().enumerate() {
            if let Some(HwSlotSpec::Execute { address }) = slot {
                if *address == pc && skip != Some((i, pc)) {
                    self.suppressed = Some((i, pc));
                    return Some(RawStopEvent::HwSlot {
                        tid: SIM_TID,
                        slot: i,
                        pc,
                        access_address: pc,
                    });
                }
            }
        }

        // fetch; a window shorter than the longest encoding is fine as long
        // as the actual instruction fits
        let region = match self.region_for(pc, 1) {
            Some(idx) => idx,
            None => return Some(self.fault(pc, FaultKind::Segfault, pc)),
        };
        let (r, data) = &self.regions[region];
        let off = (pc - r.base) as usize;
        let avail = (data.len() - off).min(MAX_INSN_LEN);
        let window = data[off..off + avail].to_vec();

        if window[0] == TRAP_OPCODE {
            return Some(RawStopEvent::Trap { tid: SIM_TID, pc });
        }
        let insn = match disasm::decode(&window, pc) {
            Ok(i) => i,
            Err(_) => return Some(self.fault(pc, FaultKind::IllegalInstruction, pc)),
        };

        // data watch slots fire before the access happens
        match insn.op {
            Op::Load { addr, .. } => {
                if let Some((slot, a)) = self.matching_watch_slot(addr, 8, false) {
                    if skip != Some((slot, pc)) {
                        self.suppressed = Some((slot, pc));
                        return Some(RawStopEvent::HwSlot {
                            tid: SIM_TID,
                            slot,
                            pc,
                            access_address: a,
                        });
                    }
                }
            }
            Op::Store { addr, .. } => {
                if let Some((slot, a)) = self.matching_watch_slot(addr, 8, true) {
                    if skip != Some((slot, pc)) {
                        self.suppressed = Some((slot, pc));
                        return Some(RawStopEvent::HwSlot {
                            tid: SIM_TID,
                            slot,
                            pc,
                            access_address: a,
                        });
                    }
                }
            }
            _ => {}
        }

        let next = insn.next_address();
        let get = |regs: &RegisterSet, r: u8| regs.get(disasm::reg_name(r)).unwrap_or(0);

        match insn.op {
            Op::Nop => self.regs.set_pc(next),
            Op::MovImm { dst, imm } => {
                self.regs.set(disasm::reg_name(dst), imm);
                self.regs.set_pc(next);
            }
            Op::Mov { dst, src } => {
                let v = get(&self.regs, src);
                self.regs.set(disasm::reg_name(dst), v);
                self.regs.set_pc(next);
            }
            Op::Add { dst, src } => {
                let v = get(&self.regs, dst).wrapping_add(get(&self.regs, src));
                self.regs.set(disasm::reg_name(dst), v);
                self.regs.set_pc(next);
            }
            Op::Sub { dst, src } => {
                let v = get(&self.regs, dst).wrapping_sub(get(&self.regs, src));
                self.regs.set(disasm::reg_name(dst), v);
                self.regs.set_pc(next);
            }
            Op::Load { dst, addr } => match self.read_u64_checked(addr, pc) {
                Ok(v) => {
                    self.regs.set(disasm::reg_name(dst), v);
                    self.regs.set_pc(next);
                }
                Err(stop) => return Some(stop),
            },
            Op::Store { addr, src } => {
                let v = get(&self.regs, src);
                match self.write_u64_checked(addr, v, pc) {
                    Ok(()) => self.regs.set_pc(next),
                    Err(stop) => return Some(stop),
                }
            }
            Op::Call { target } => {
                let sp = self.regs.sp().wrapping_sub(8);
                match self.write_u64_checked(sp, next, pc) {
                    Ok(()) => {
                        self.regs.set_sp(sp);
                        self.regs.set_pc(target);
                    }
                    Err(stop) => return Some(stop),
                }
            }
            Op::Ret => {
                let sp = self.regs.sp();
                match self.read_u64_checked(sp, pc) {
                    Ok(ret) => {
                        self.regs.set_sp(sp.wrapping_add(8));
                        self.regs.set_pc(ret);
                    }
                    Err(stop) => return Some(stop),
                }
            }
            Op::Enter => {
                let sp = self.regs.sp().wrapping_sub(8);
                let fp = self.regs.fp();
                match self.write_u64_checked(sp, fp, pc) {
                    Ok(()) => {
                        self.regs.set_sp(sp);
                        self.regs.set_fp(sp);
                        self.regs.set_pc(next);
                    }
                    Err(stop) => return Some(stop),
                }
            }
            Op::Leave => {
                let fp = self.regs.fp();
                match self.read_u64_checked(fp, pc) {
                    Ok(saved) => {
                        self.regs.set_sp(fp.wrapping_add(8));
                        self.regs.set_fp(saved);
                        self.regs.set_pc(next);
                    }
                    Err(stop) => return Some(stop),
                }
            }
            Op::Jmp { target } => self.regs.set_pc(target),
            Op::Bnz { cond, target } => {
                if get(&self.regs, cond) != 0 {
                    self.regs.set_pc(target);
                } else {
                    self.regs.set_pc(next);
                }
            }
            Op::Halt => {
                let code = get(&self.regs, 0) as i64;
                self.exited = Some(code);
                return Some(RawStopEvent::Exited { code });
            }
            Op::Trap => unreachable!("trap opcode handled before decode"),
        }

        self.executed += 1;
        if let Some(limit) = self.auto_interrupt_after {
            if self.executed >= limit {
                self.interrupt.store(true, Ordering::SeqCst);
            }
        }
        None
    }
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetBackend for SimTarget {
    fn pid(&self) -> u32 {
        1
    }

    fn memory_map(&mut self) -> Result<Vec<MemoryRegion>> {
        Ok(self.regions.iter().map(|(r, _)| r.clone()).collect())
    }

    fn threads(&mut self) -> Result<Vec<ThreadId>> {
        Ok(vec![SIM_TID])
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.read_raw(addr, buf)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.write_raw(addr, data)
    }

    fn read_registers(&mut self, tid: ThreadId) -> Result<RegisterSet> {
        if tid != SIM_TID {
            return Err(DebugError::Backend {
                operation: "read_registers",
                reason: format!("unknown thread {tid}"),
            });
        }
        Ok(self.regs.clone())
    }

    fn write_registers(&mut self, tid: ThreadId, regs: &RegisterSet) -> Result<()> {
        if tid != SIM_TID {
            return Err(DebugError::Backend {
                operation: "write_registers",
                reason: format!("unknown thread {tid}"),
            });
        }
        self.regs = regs.clone();
        Ok(())
    }

    fn set_hw_slot(&mut self, slot: usize, spec: HwSlotSpec) -> Result<()> {
        if slot >= HW_SLOT_COUNT {
            return Err(DebugError::Backend {
                operation: "set_hw_slot",
                reason: format!("slot {slot} out of range"),
            });
        }
        self.hw_slots[slot] = Some(spec);
        Ok(())
    }

    fn clear_hw_slot(&mut self, slot: usize) -> Result<()> {
        if slot >= HW_SLOT_COUNT {
            return Err(DebugError::Backend {
                operation: "clear_hw_slot",
                reason: format!("slot {slot} out of range"),
            });
        }
        self.hw_slots[slot] = None;
        Ok(())
    }

    fn resume(&mut self) -> Result<RawStopEvent> {
        loop {
            if self.interrupt.swap(false, Ordering::SeqCst) {
                return Ok(RawStopEvent::Signal {
                    tid: SIM_TID,
                    signal: StopSignal::Interrupt,
                    pc: self.regs.pc(),
                });
            }
            if let Some(stop) = self.exec_one() {
                return Ok(stop);
            }
        }
    }

    fn single_step(&mut self, _tid: ThreadId) -> Result<RawStopEvent> {
        match self.exec_one() {
            Some(stop) => Ok(stop),
            None => Ok(RawStopEvent::SingleStep {
                tid: SIM_TID,
                pc: self.regs.pc(),
            }),
        }
    }

    fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn detach(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::WatchAccess;

    #[test]
    fn straight_line_execution_reaches_halt() {
        let mut t = SimTarget::with_program(&[
            Op::MovImm { dst: 0, imm: 0 },
            Op::MovImm { dst: 1, imm: 5 },
            Op::Add { dst: 0, src: 1 },
            Op::Halt,
        ]);
        // r0 holds 5 at halt, but exit code is r0 at the halt instruction
        let stop = t.resume().unwrap();
        assert_eq!(stop, RawStopEvent::Exited { code: 5 });
    }

    #[test]
    fn single_step_advances_by_encoded_length() {
        let mut t = SimTarget::with_program(&[Op::MovImm { dst: 0, imm: 1 }, Op::Nop, Op::Halt]);
        let s1 = t.single_step(SIM_TID).unwrap();
        assert_eq!(
            s1,
            RawStopEvent::SingleStep {
                tid: SIM_TID,
                pc: CODE_BASE + 10
            }
        );
        let s2 = t.single_step(SIM_TID).unwrap();
        assert_eq!(
            s2,
            RawStopEvent::SingleStep {
                tid: SIM_TID,
                pc: CODE_BASE + 11
            }
        );
    }

    #[test]
    fn trap_opcode_stops_without_advancing() {
        let mut t = SimTarget::with_program(&[Op::Nop, Op::Trap, Op::Halt]);
        let stop = t.resume().unwrap();
        assert_eq!(
            stop,
            RawStopEvent::Trap {
                tid: SIM_TID,
                pc: CODE_BASE + 1
            }
        );
        // pc stays on the trap
        assert_eq!(t.regs.pc(), CODE_BASE + 1);
    }

    #[test]
    fn unmapped_load_faults_with_address() {
        let mut t = SimTarget::with_program(&[Op::Load {
            dst: 0,
            addr: 0x4141_4141,
        }]);
        let stop = t.resume().unwrap();
        assert_eq!(
            stop,
            RawStopEvent::Fault {
                tid: SIM_TID,
                pc: CODE_BASE,
                kind: FaultKind::Segfault,
                address: 0x4141_4141,
            }
        );
    }

    #[test]
    fn watch_slot_fires_once_then_execution_passes() {
        let mut t = SimTarget::with_program(&[
            Op::MovImm { dst: 0, imm: 7 },
            Op::Store {
                addr: DATA_BASE,
                src: 0,
            },
            Op::Halt,
        ]);
        t.set_hw_slot(
            0,
            HwSlotSpec::Access {
                address: DATA_BASE,
                len: 8,
                access: WatchAccess::Write,
            },
        )
        .unwrap();
        let stop = t.resume().unwrap();
        assert!(matches!(stop, RawStopEvent::HwSlot { slot: 0, .. }));
        // resuming executes the store and runs to exit
        let stop = t.resume().unwrap();
        assert_eq!(stop, RawStopEvent::Exited { code: 7 });
        let mut buf = [0u8; 8];
        t.read_memory(DATA_BASE, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 7);
    }

    #[test]
    fn interrupt_flag_preempts_resume() {
        let mut t = SimTarget::with_program(&[Op::Jmp { target: CODE_BASE }]);
        t.auto_interrupt_after(100);
        let stop = t.resume().unwrap();
        assert!(matches!(
            stop,
            RawStopEvent::Signal {
                signal: StopSignal::Interrupt,
                ..
            }
        ));
    }

    #[test]
    fn call_enter_leave_ret_maintain_frame_chain() {
        // main: call f; halt    f: enter; leave; ret
        let f_addr = CODE_BASE + 10; // call(9) + halt(1)
        let mut t = SimTarget::with_program(&[
            Op::Call { target: f_addr },
            Op::Halt,
            Op::Enter,
            Op::Leave,
            Op::Ret,
        ]);
        t.set_register("r0", 3);
        // step through call, enter
        t.single_step(SIM_TID).unwrap();
        t.single_step(SIM_TID).unwrap();
        let fp = t.regs.fp();
        assert!(fp >= STACK_BASE);
        // saved fp at [fp] is the old fp (0), return address at [fp + 8]
        let mut buf = [0u8; 8];
        t.read_memory(fp + 8, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), CODE_BASE + 9);
        let stop = t.resume().unwrap();
        assert_eq!(stop, RawStopEvent::Exited { code: 3 });
    }
}
