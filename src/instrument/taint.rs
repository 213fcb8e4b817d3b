//! Taint propagation
//!
//! Forward data-flow over a recorded execution trace. The caller marks
//! registers or memory cells as taint sources, replays a [`TraceLog`]
//! through the tracker, and reads back which locations ended up carrying
//! attacker-influenced data. Memory is tracked at the ISA's 8-byte access
//! granularity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::analysis::disasm::{reg_name, Op};
use crate::instrument::{TraceEntry, TraceLog};

/// Longest source-to-sink chain taint will follow. Data that is this many
/// copies removed from a source stops counting as tainted.
pub const MAX_PROPAGATION_DEPTH: u32 = 64;

/// One observed propagation or control-flow influence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintFlow {
    /// Index of the trace entry that caused it.
    pub step: usize,
    pub pc: u64,
    pub detail: String,
}

impl fmt::Display for TaintFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:#x}: {}", self.step, self.pc, self.detail)
    }
}

/// Final taint state after replaying a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintReport {
    pub tainted_registers: BTreeSet<String>,
    pub tainted_memory: BTreeSet<u64>,
    pub flows: Vec<TaintFlow>,
    /// Branches whose condition register was tainted when evaluated.
    pub tainted_branches: usize,
}

/// Forward taint tracker. Deterministic: state depends only on the sources
/// and the replayed entries, in order. Each tainted location carries its
/// distance from a source; propagation past [`MAX_PROPAGATION_DEPTH`]
/// produces clean data.
#[derive(Debug, Clone, Default)]
pub struct TaintTracker {
    registers: BTreeMap<String, u32>,
    memory: BTreeMap<u64, u32>,
    flows: Vec<TaintFlow>,
    tainted_branches: usize,
}

impl TaintTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a register as a taint source.
    pub fn taint_register(&mut self, name: &str) {
        self.registers.insert(name.to_string(), 0);
    }

    /// Mark the 8-byte cell at `address` as a taint source.
    pub fn taint_memory(&mut self, address: u64) {
        self.memory.insert(address, 0);
    }

    pub fn is_register_tainted(&self, name: &str) -> bool {
        self.registers.contains_key(name)
    }

    pub fn is_memory_tainted(&self, address: u64) -> bool {
        self.memory.contains_key(&address)
    }

    /// Depth of the taint carried by `src`, bumped by one hop, or `None`
    /// when the result would exceed the propagation cap.
    fn hop_from_register(&self, src: &str) -> Option<u32> {
        let d = *self.registers.get(src)?;
        (d < MAX_PROPAGATION_DEPTH).then_some(d + 1)
    }

    fn hop_from_memory(&self, addr: u64) -> Option<u32> {
        let d = *self.memory.get(&addr)?;
        (d < MAX_PROPAGATION_DEPTH).then_some(d + 1)
    }

    fn record(&mut self, entry: &TraceEntry, detail: String) {
        self.flows.push(TaintFlow {
            step: entry.index,
            pc: entry.pc,
            detail,
        });
    }

    /// Propagate taint across one executed instruction.
    pub fn apply(&mut self, entry: &TraceEntry) {
        match entry.op {
            // immediate loads always produce clean data
            Op::MovImm { dst, .. } => {
                self.registers.remove(reg_name(dst));
            }
            Op::Mov { dst, src } => {
                if let Some(depth) = self.hop_from_register(reg_name(src)) {
                    let fresh = self
                        .registers
                        .insert(reg_name(dst).to_string(), depth)
                        .is_none();
                    if fresh {
                        self.record(entry, format!("{} <- {}", reg_name(dst), reg_name(src)));
                    }
                } else {
                    self.registers.remove(reg_name(dst));
                }
            }
            Op::Add { dst, src } | Op::Sub { dst, src } => {
                // dst keeps its own taint and absorbs the operand's
                if let Some(depth) = self.hop_from_register(reg_name(src)) {
                    let dst = reg_name(dst);
                    match self.registers.get_mut(dst) {
                        Some(d) => *d = (*d).min(depth),
                        None => {
                            self.registers.insert(dst.to_string(), depth);
                            self.record(entry, format!("{dst} <- {}", reg_name(src)));
                        }
                    }
                }
            }
            Op::Load { dst, addr } => {
                if let Some(depth) = self.hop_from_memory(addr) {
                    let fresh = self
                        .registers
                        .insert(reg_name(dst).to_string(), depth)
                        .is_none();
                    if fresh {
                        self.record(entry, format!("{} <- [{addr:#x}]", reg_name(dst)));
                    }
                } else {
                    self.registers.remove(reg_name(dst));
                }
            }
            Op::Store { addr, src } => {
                if let Some(depth) = self.hop_from_register(reg_name(src)) {
                    let fresh = self.memory.insert(addr, depth).is_none();
                    if fresh {
                        self.record(entry, format!("[{addr:#x}] <- {}", reg_name(src)));
                    }
                } else {
                    self.memory.remove(&addr);
                }
            }
            Op::Bnz { cond, .. } => {
                if self.is_register_tainted(reg_name(cond)) {
                    self.tainted_branches += 1;
                    self.record(entry, format!("branch on tainted {}", reg_name(cond)));
                }
            }
            Op::Nop
            | Op::Call { .. }
            | Op::Ret
            | Op::Jmp { .. }
            | Op::Enter
            | Op::Leave
            | Op::Halt
            | Op::Trap => {}
        }
    }

    /// Replay a whole trace and report the resulting taint state.
    pub fn run(mut self, log: &TraceLog) -> TaintReport {
        for entry in &log.entries {
            self.apply(entry);
        }
        log::debug!(
            "taint replay over {} step(s): {} register(s), {} cell(s) tainted",
            log.entries.len(),
            self.registers.len(),
            self.memory.len()
        );
        TaintReport {
            tainted_registers: self.registers.into_keys().collect(),
            tainted_memory: self.memory.into_keys().collect(),
            flows: self.flows,
            tainted_branches: self.tainted_branches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Session;
    use crate::debug::sim::{SimTarget, DATA_BASE};

    fn trace_of(ops: &[Op], budget: usize) -> TraceLog {
        let mut s = Session::attach(Box::new(SimTarget::with_program(ops))).unwrap();
        s.trace(budget).unwrap()
    }

    #[test]
    fn taint_flows_register_to_register() {
        let log = trace_of(
            &[
                Op::Mov { dst: 1, src: 0 },
                Op::Add { dst: 2, src: 1 },
                Op::Halt,
            ],
            3,
        );
        let mut t = TaintTracker::new();
        t.taint_register("r0");
        let report = t.run(&log);
        assert!(report.tainted_registers.contains("r0"));
        assert!(report.tainted_registers.contains("r1"));
        assert!(report.tainted_registers.contains("r2"));
        assert_eq!(report.flows.len(), 2);
    }

    #[test]
    fn immediate_overwrite_clears_taint() {
        let log = trace_of(
            &[
                Op::Mov { dst: 1, src: 0 },
                Op::MovImm { dst: 1, imm: 0 },
                Op::Halt,
            ],
            3,
        );
        let mut t = TaintTracker::new();
        t.taint_register("r0");
        let report = t.run(&log);
        assert!(!report.tainted_registers.contains("r1"));
    }

    #[test]
    fn taint_flows_through_memory() {
        let addr = DATA_BASE + 0x20;
        let log = trace_of(
            &[
                Op::Store { addr, src: 0 },
                Op::Load { dst: 3, addr },
                Op::Halt,
            ],
            3,
        );
        let mut t = TaintTracker::new();
        t.taint_register("r0");
        let report = t.run(&log);
        assert!(report.tainted_memory.contains(&addr));
        assert!(report.tainted_registers.contains("r3"));
    }

    #[test]
    fn clean_store_scrubs_a_tainted_cell() {
        let addr = DATA_BASE + 0x20;
        let log = trace_of(
            &[Op::MovImm { dst: 1, imm: 7 }, Op::Store { addr, src: 1 }, Op::Halt],
            3,
        );
        let mut t = TaintTracker::new();
        t.taint_memory(addr);
        let report = t.run(&log);
        assert!(!report.tainted_memory.contains(&addr));
    }

    #[test]
    fn tainted_branch_condition_is_counted() {
        let log = trace_of(
            &[
                Op::Bnz {
                    cond: 0,
                    target: crate::debug::sim::CODE_BASE + 11,
                },
                Op::Nop,
                Op::Halt,
            ],
            3,
        );
        let mut t = TaintTracker::new();
        t.taint_register("r0");
        let report = t.run(&log);
        assert_eq!(report.tainted_branches, 1);
    }

    #[test]
    fn propagation_stops_at_the_depth_cap() {
        // bounce the value between r0 and r1, one hop per mov
        let hops = MAX_PROPAGATION_DEPTH + 1;
        let mut ops = Vec::new();
        for i in 0..hops {
            let (dst, src) = if i % 2 == 0 { (1, 0) } else { (0, 1) };
            ops.push(Op::Mov { dst, src });
        }
        ops.push(Op::Halt);
        let log = trace_of(&ops, ops.len());
        let mut t = TaintTracker::new();
        t.taint_register("r0");
        let report = t.run(&log);
        // the final hop exceeded the cap, so its destination came out clean
        assert!(!report.tainted_registers.contains("r1"));
        assert!(report.tainted_registers.contains("r0"));
    }

    #[test]
    fn replay_is_deterministic() {
        let log = trace_of(
            &[
                Op::Mov { dst: 1, src: 0 },
                Op::Store {
                    addr: DATA_BASE,
                    src: 1,
                },
                Op::Halt,
            ],
            3,
        );
        let mk = || {
            let mut t = TaintTracker::new();
            t.taint_register("r0");
            t.run(&log)
        };
        assert_eq!(mk(), mk());
    }
}
