//! Dynamic instrumentation engine
//!
//! Hooks, execution tracing, taint propagation, and structural path
//! exploration. Hooks fire on the stop path: when a stop lands on a hooked
//! address every callback registered there runs, in registration order,
//! before the stop becomes visible to the caller. A callback can vote to
//! resume the target transparently instead of surfacing the stop.

pub mod symbolic;
pub mod taint;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::analysis::disasm::{Instruction, Op};
use crate::core::error::{DebugError, Result};
use crate::core::registers::{RegisterDelta, RegisterSet};
use crate::core::session::{Session, StopReason};
use crate::debug::ThreadId;

/// Hard wall-clock bound on a single trace, on top of the step budget.
const TRACE_WALL_LIMIT: Duration = Duration::from_secs(30);

pub type HookId = u32;

/// What a hook callback wants done with the stop it observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    /// Surface the stop to the caller as usual.
    Stay,
    /// Swallow the stop and resume the target.
    Resume,
}

/// Read-only view handed to hook callbacks. Callbacks observe; they never
/// reach back into the session, which keeps dispatch re-entrancy free.
pub struct HookContext<'a> {
    pub tid: ThreadId,
    pub pc: u64,
    pub regs: &'a RegisterSet,
    /// Times this hook has fired, counting this one.
    pub hit_count: u64,
}

type HookFn = Box<dyn FnMut(&HookContext<'_>) -> HookVerdict>;

struct Hook {
    id: HookId,
    address: u64,
    hit_count: u64,
    callback: HookFn,
}

/// Hook registry and dispatcher for one session.
#[derive(Default)]
pub struct InstrumentationEngine {
    next_id: HookId,
    hooks: BTreeMap<HookId, Hook>,
    dispatching: bool,
}

impl InstrumentationEngine {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn install(
        &mut self,
        address: u64,
        callback: impl FnMut(&HookContext<'_>) -> HookVerdict + 'static,
    ) -> HookId {
        let id = self.next_id;
        self.next_id += 1;
        self.hooks.insert(
            id,
            Hook {
                id,
                address,
                hit_count: 0,
                callback: Box::new(callback),
            },
        );
        log::debug!("hook {id} installed at {address:#x}");
        id
    }

    pub fn remove(&mut self, id: HookId) -> Result<()> {
        self.hooks
            .remove(&id)
            .map(|_| ())
            .ok_or(DebugError::UnknownId { id })
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    pub fn has_hooks_at(&self, pc: u64) -> bool {
        self.hooks.values().any(|h| h.address == pc)
    }

    /// `(id, address, hit_count)` for every installed hook, in id order.
    pub fn list(&self) -> Vec<(HookId, u64, u64)> {
        self.hooks
            .values()
            .map(|h| (h.id, h.address, h.hit_count))
            .collect()
    }

    /// Run every hook registered at `pc`, in registration order. The queue
    /// of matching hooks is snapshotted up front, so a callback removing or
    /// adding hooks takes effect only from the next stop. Resume wins if
    /// any callback votes for it.
    pub fn dispatch(&mut self, tid: ThreadId, pc: u64, regs: &RegisterSet) -> Result<HookVerdict> {
        if self.dispatching {
            return Err(DebugError::StateViolation {
                operation: "hook_dispatch",
                state: "already dispatching hooks".into(),
            });
        }
        self.dispatching = true;
        let queue: Vec<HookId> = self
            .hooks
            .values()
            .filter(|h| h.address == pc)
            .map(|h| h.id)
            .collect();
        let mut verdict = HookVerdict::Stay;
        for id in queue {
            let Some(hook) = self.hooks.get_mut(&id) else {
                continue;
            };
            hook.hit_count += 1;
            let ctx = HookContext {
                tid,
                pc,
                regs,
                hit_count: hook.hit_count,
            };
            if (hook.callback)(&ctx) == HookVerdict::Resume {
                verdict = HookVerdict::Resume;
            }
        }
        self.dispatching = false;
        Ok(verdict)
    }
}

/// One executed instruction in a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub index: usize,
    pub pc: u64,
    pub op: Op,
    /// Registers changed by this instruction (pc included).
    pub register_deltas: Vec<RegisterDelta>,
    /// Data write performed by this instruction, as `(address, value)`.
    pub memory_write: Option<(u64, u64)>,
}

/// Bounded execution trace. `truncated` is set when the instruction budget
/// ran out while the target could still run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLog {
    pub entries: Vec<TraceEntry>,
    pub truncated: bool,
    /// Why tracing ended, when it was not the budget.
    pub final_stop: Option<StopReason>,
}

impl TraceLog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The `(address, value)` a retired instruction wrote to memory, derived
/// from its operands and the pre-step registers. Stack pushes count.
fn data_write(insn: &Instruction, before: &RegisterSet) -> Option<(u64, u64)> {
    match insn.op {
        Op::Store { addr, src } => Some((addr, before.get(&format!("r{src}")).unwrap_or(0))),
        Op::Call { .. } => Some((
            before.sp().wrapping_sub(8),
            insn.address + insn.bytes.len() as u64,
        )),
        Op::Enter => Some((before.sp().wrapping_sub(8), before.fp())),
        _ => None,
    }
}

impl Session {
    /// Install a hook at `address`. The address must be mapped; hooks on
    /// unmapped addresses could never fire.
    pub fn install_hook(
        &mut self,
        address: u64,
        callback: impl FnMut(&HookContext<'_>) -> HookVerdict + 'static,
    ) -> Result<HookId> {
        self.ensure_attached("install_hook")?;
        if !self.memory_map.contains(address) {
            return Err(DebugError::InvalidAddress { address });
        }
        Ok(self.instrumentation.install(address, callback))
    }

    pub fn remove_hook(&mut self, id: HookId) -> Result<()> {
        self.instrumentation.remove(id)
    }

    pub fn hooks(&self) -> Vec<(HookId, u64, u64)> {
        self.instrumentation.list()
    }

    /// Single-step the target recording, per executed instruction, the pc,
    /// the decoded op, the registers it changed, and the data write it
    /// performed, up to `budget` instructions or [`TRACE_WALL_LIMIT`].
    /// Stops early when the target exits or stops for any reason other
    /// than the step itself; that never counts as truncation.
    pub fn trace(&mut self, budget: usize) -> Result<TraceLog> {
        self.ensure_attached("trace")?;
        self.ensure_stopped("trace")?;
        let deadline = Instant::now() + TRACE_WALL_LIMIT;
        let mut entries = Vec::new();
        let mut final_stop = None;
        let mut out_of_time = false;
        while entries.len() < budget {
            if Instant::now() >= deadline {
                out_of_time = true;
                break;
            }
            let before = self.registers_current()?;
            let pc = before.pc();
            let insn = self.decode_at(pc);
            let ev = self.step_into()?;
            let register_deltas = match ev.reason {
                StopReason::Exit(_) => Vec::new(),
                _ => self.registers_current()?.diff(&before),
            };
            let memory_write = match ev.reason {
                // a fault means the instruction never retired its write
                StopReason::Signal(_) => None,
                _ => insn.as_ref().and_then(|i| data_write(i, &before)),
            };
            if let Some(insn) = insn {
                entries.push(TraceEntry {
                    index: entries.len(),
                    pc,
                    op: insn.op,
                    register_deltas,
                    memory_write,
                });
            }
            match ev.reason {
                StopReason::SingleStep => {}
                other => {
                    final_stop = Some(other);
                    break;
                }
            }
        }
        let truncated = out_of_time || (final_stop.is_none() && entries.len() >= budget);
        log::debug!(
            "trace captured {} instruction(s), truncated={truncated}",
            entries.len()
        );
        Ok(TraceLog {
            entries,
            truncated,
            final_stop,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::StopReason;
    use crate::debug::sim::{SimTarget, CODE_BASE, DATA_BASE};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn session(ops: &[Op]) -> Session {
        Session::attach(Box::new(SimTarget::with_program(ops))).unwrap()
    }

    #[test]
    fn hook_runs_before_stop_surfaces() {
        let mut s = session(&[Op::Nop, Op::Trap, Op::Halt]);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        s.install_hook(CODE_BASE + 1, move |ctx| {
            log.borrow_mut().push((ctx.pc, ctx.hit_count));
            HookVerdict::Stay
        })
        .unwrap();
        let ev = s.resume().unwrap();
        // the hook observed the stop before resume returned it
        assert_eq!(*seen.borrow(), vec![(CODE_BASE + 1, 1)]);
        assert_eq!(ev.pc, CODE_BASE + 1);
    }

    #[test]
    fn resume_verdict_swallows_the_stop() {
        let body = CODE_BASE + 10;
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
        s.set_breakpoint(body, crate::core::breakpoint::BreakpointKind::Software, None)
            .unwrap();
        let hits = Rc::new(RefCell::new(0u64));
        let counter = Rc::clone(&hits);
        s.install_hook(body, move |_| {
            *counter.borrow_mut() += 1;
            HookVerdict::Resume
        })
        .unwrap();
        // every breakpoint hit is swallowed; the program runs to exit
        let ev = s.resume().unwrap();
        assert_eq!(ev.reason, StopReason::Exit(0));
        assert_eq!(*hits.borrow(), 3);
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        let mut s = session(&[Op::Trap, Op::Halt]);
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Rc::clone(&order);
            s.install_hook(CODE_BASE, move |_| {
                order.borrow_mut().push(tag);
                HookVerdict::Stay
            })
            .unwrap();
        }
        s.resume().unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn removed_hook_stops_firing() {
        let mut s = session(&[Op::Trap, Op::Halt]);
        let hits = Rc::new(RefCell::new(0u64));
        let counter = Rc::clone(&hits);
        let id = s
            .install_hook(CODE_BASE, move |_| {
                *counter.borrow_mut() += 1;
                HookVerdict::Stay
            })
            .unwrap();
        s.remove_hook(id).unwrap();
        s.resume().unwrap();
        assert_eq!(*hits.borrow(), 0);
        assert!(matches!(
            s.remove_hook(id),
            Err(DebugError::UnknownId { .. })
        ));
    }

    #[test]
    fn hook_on_unmapped_address_is_rejected() {
        let mut s = session(&[Op::Halt]);
        assert!(matches!(
            s.install_hook(0xdead_0000, |_| HookVerdict::Stay),
            Err(DebugError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn trace_records_executed_instructions() {
        let mut s = session(&[
            Op::MovImm { dst: 0, imm: 1 },
            Op::MovImm { dst: 1, imm: 2 },
            Op::Add { dst: 0, src: 1 },
            Op::Store {
                addr: DATA_BASE,
                src: 0,
            },
            Op::Halt,
        ]);
        let log = s.trace(5).unwrap();
        assert_eq!(log.len(), 5);
        assert!(!log.truncated);
        assert_eq!(log.final_stop, Some(StopReason::Exit(3)));
        assert_eq!(log.entries[0].pc, CODE_BASE);
        assert_eq!(log.entries[4].op, Op::Halt);

        // the first movi changed pc and r0
        let deltas = &log.entries[0].register_deltas;
        assert!(deltas.iter().any(|d| d.name == "pc"));
        assert!(deltas
            .iter()
            .any(|d| d.name == "r0" && d.old == 0 && d.new == 1));
        // the store wrote r0 (1 + 2) to DATA_BASE
        assert_eq!(log.entries[3].memory_write, Some((DATA_BASE, 3)));
        assert_eq!(log.entries[0].memory_write, None);
    }

    #[test]
    fn trace_budget_marks_truncation() {
        let mut s = session(&[Op::Jmp { target: CODE_BASE }]);
        let log = s.trace(10).unwrap();
        assert_eq!(log.len(), 10);
        assert!(log.truncated);
        assert!(log.final_stop.is_none());
        // every entry is the same jmp
        assert!(log.entries.iter().all(|e| e.pc == CODE_BASE));
    }

    #[test]
    fn trace_sees_through_breakpoint_bytes() {
        let mut s = session(&[Op::Nop, Op::Nop, Op::Halt]);
        s.set_breakpoint(
            CODE_BASE,
            crate::core::breakpoint::BreakpointKind::Software,
            None,
        )
        .unwrap();
        let log = s.trace(1).unwrap();
        // the recorded op is the original instruction, not the trap byte
        assert_eq!(log.entries[0].op, Op::Nop);
    }
}
