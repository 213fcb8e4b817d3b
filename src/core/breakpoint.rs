//! Breakpoint & watchpoint manager
//!
//! [`TrapStore`] is pure bookkeeping: ids, kinds, saved bytes, slot
//! assignments, hit counts. All target mutation (writing trap opcodes,
//! arming debug registers) happens through the owning [`Session`], so no
//! subsystem ever touches target memory behind the controller's back.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::analysis::disasm::TRAP_OPCODE;
use crate::core::error::{DebugError, Result};
use crate::core::session::Session;
use crate::debug::{HwSlotSpec, RawStopEvent, WatchAccess, HW_SLOT_COUNT};

/// Stable trap identifier, unique across breakpoints and watchpoints and
/// preserved across enable/disable.
pub type TrapId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Saved-byte trap opcode patch.
    Software,
    /// Debug-register slot.
    Hardware,
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointKind::Software => write!(f, "software"),
            BreakpointKind::Hardware => write!(f, "hardware"),
        }
    }
}

/// Left-hand side of a breakpoint condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondOperand {
    Register(String),
    /// 8-byte read at the address.
    Memory(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Conditional-breakpoint expression: `reg|mem:<addr> OP <constant>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub lhs: CondOperand,
    pub op: CondOp,
    pub rhs: u64,
}

impl Condition {
    pub fn holds(&self, lhs_value: u64) -> bool {
        match self.op {
            CondOp::Eq => lhs_value == self.rhs,
            CondOp::Ne => lhs_value != self.rhs,
            CondOp::Lt => lhs_value < self.rhs,
            CondOp::Le => lhs_value <= self.rhs,
            CondOp::Gt => lhs_value > self.rhs,
            CondOp::Ge => lhs_value >= self.rhs,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lhs = match &self.lhs {
            CondOperand::Register(r) => r.clone(),
            CondOperand::Memory(a) => format!("mem:{a:#x}"),
        };
        let op = match self.op {
            CondOp::Eq => "==",
            CondOp::Ne => "!=",
            CondOp::Lt => "<",
            CondOp::Le => "<=",
            CondOp::Gt => ">",
            CondOp::Ge => ">=",
        };
        write!(f, "{lhs} {op} {:#x}", self.rhs)
    }
}

impl FromStr for Condition {
    type Err = String;

    /// Accepts `r0 == 5`, `mem:0x5000 != 0`, `sp < 0x70001000`, ...
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(format!("bad condition {s:?}, expected <lhs> <op> <value>"));
        }
        let lhs = if let Some(addr) = parts[0].strip_prefix("mem:") {
            CondOperand::Memory(parse_u64(addr).ok_or_else(|| format!("bad address {addr:?}"))?)
        } else {
            CondOperand::Register(parts[0].to_string())
        };
        let op = match parts[1] {
            "==" => CondOp::Eq,
            "!=" => CondOp::Ne,
            "<" => CondOp::Lt,
            "<=" => CondOp::Le,
            ">" => CondOp::Gt,
            ">=" => CondOp::Ge,
            other => return Err(format!("bad comparison operator {other:?}")),
        };
        let rhs = parse_u64(parts[2]).ok_or_else(|| format!("bad value {:?}", parts[2]))?;
        Ok(Condition { lhs, op, rhs })
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// One breakpoint record.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: TrapId,
    pub address: u64,
    pub kind: BreakpointKind,
    pub enabled: bool,
    pub condition: Option<Condition>,
    pub hit_count: u64,
    pub one_shot: bool,
    /// Original instruction byte replaced by the trap opcode.
    pub(crate) saved_byte: Option<u8>,
    pub(crate) hw_slot: Option<usize>,
    /// Engine-owned (step-over return breakpoints); never surfaced as a
    /// user stop reason by the step logic that installs it.
    pub(crate) internal: bool,
}

/// One watchpoint record. Always hardware-backed.
#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub id: TrapId,
    pub address: u64,
    pub len: u64,
    pub access: WatchAccess,
    pub enabled: bool,
    pub hit_count: u64,
    pub(crate) hw_slot: usize,
}

/// Which trap a raw stop resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapMatch {
    Breakpoint(TrapId),
    Watchpoint(TrapId),
}

/// Bookkeeping for all active traps of one session.
#[derive(Default)]
pub struct TrapStore {
    next_id: TrapId,
    breakpoints: BTreeMap<TrapId, Breakpoint>,
    watchpoints: BTreeMap<TrapId, Watchpoint>,
    hw_slots: [Option<TrapId>; HW_SLOT_COUNT],
}

impl TrapStore {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    fn alloc_id(&mut self) -> TrapId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_slot(&mut self, owner: TrapId) -> Result<usize> {
        for (i, slot) in self.hw_slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(owner);
                return Ok(i);
            }
        }
        Err(DebugError::ResourceExhausted {
            resource: "hardware debug-register slots",
        })
    }

    fn release_slot(&mut self, slot: usize) {
        self.hw_slots[slot] = None;
    }

    /// At most one enabled breakpoint per (address, kind).
    fn check_unique(&self, address: u64, kind: BreakpointKind) -> Result<()> {
        if self
            .breakpoints
            .values()
            .any(|b| b.enabled && b.address == address && b.kind == kind)
        {
            return Err(DebugError::DuplicateTrap {
                address,
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    pub fn breakpoint(&self, id: TrapId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub(crate) fn breakpoint_mut(&mut self, id: TrapId) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&id)
    }

    pub fn watchpoint(&self, id: TrapId) -> Option<&Watchpoint> {
        self.watchpoints.get(&id)
    }

    pub(crate) fn watchpoint_mut(&mut self, id: TrapId) -> Option<&mut Watchpoint> {
        self.watchpoints.get_mut(&id)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// Caller-owned breakpoints only; engine-internal traps (step-over
    /// return breakpoints) are hidden.
    pub fn user_breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values().filter(|b| !b.internal)
    }

    pub fn watchpoints(&self) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.values()
    }

    /// Id of the enabled software breakpoint at `addr`, if any.
    pub fn enabled_software_at(&self, addr: u64) -> Option<TrapId> {
        self.breakpoints
            .values()
            .find(|b| b.enabled && b.kind == BreakpointKind::Software && b.address == addr)
            .map(|b| b.id)
    }

    /// Resolve a raw stop event to the trap that caused it.
    pub fn on_stop(&self, raw: &RawStopEvent) -> Option<TrapMatch> {
        match raw {
            RawStopEvent::Trap { pc, .. } => {
                self.enabled_software_at(*pc).map(TrapMatch::Breakpoint)
            }
            RawStopEvent::HwSlot { slot, .. } => {
                let owner = self.hw_slots.get(*slot).copied().flatten()?;
                if self.breakpoints.contains_key(&owner) {
                    Some(TrapMatch::Breakpoint(owner))
                } else if self.watchpoints.contains_key(&owner) {
                    Some(TrapMatch::Watchpoint(owner))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl Session {
    /// Set a breakpoint. Software kind patches the trap opcode in, hardware
    /// kind takes one of the four debug-register slots.
    pub fn set_breakpoint(
        &mut self,
        address: u64,
        kind: BreakpointKind,
        condition: Option<Condition>,
    ) -> Result<TrapId> {
        self.set_breakpoint_with(address, kind, condition, false, false)
    }

    /// Like [`set_breakpoint`](Session::set_breakpoint), removing itself
    /// after the first surfaced hit.
    pub fn set_one_shot_breakpoint(
        &mut self,
        address: u64,
        kind: BreakpointKind,
    ) -> Result<TrapId> {
        self.set_breakpoint_with(address, kind, None, true, false)
    }

    pub(crate) fn set_internal_breakpoint(&mut self, address: u64) -> Result<TrapId> {
        self.set_breakpoint_with(address, BreakpointKind::Software, None, false, true)
    }

    fn set_breakpoint_with(
        &mut self,
        address: u64,
        kind: BreakpointKind,
        condition: Option<Condition>,
        one_shot: bool,
        internal: bool,
    ) -> Result<TrapId> {
        self.ensure_attached("set_breakpoint")?;
        self.ensure_stopped("set_breakpoint")?;
        if !self.memory_map.contains(address) {
            return Err(DebugError::InvalidAddress { address });
        }
        self.traps.check_unique(address, kind)?;

        let id = self.traps.alloc_id();
        let (saved_byte, hw_slot) = match kind {
            BreakpointKind::Software => {
                let mut orig = [0u8; 1];
                self.backend.read_memory(address, &mut orig)?;
                self.backend.write_memory(address, &[TRAP_OPCODE])?;
                (Some(orig[0]), None)
            }
            BreakpointKind::Hardware => {
                let slot = self.traps.alloc_slot(id)?;
                if let Err(e) = self.backend.set_hw_slot(slot, HwSlotSpec::Execute { address }) {
                    self.traps.release_slot(slot);
                    return Err(e);
                }
                (None, Some(slot))
            }
        };

        self.traps.breakpoints.insert(
            id,
            Breakpoint {
                id,
                address,
                kind,
                enabled: true,
                condition,
                hit_count: 0,
                one_shot,
                saved_byte,
                hw_slot,
                internal,
            },
        );
        log::debug!("breakpoint {id} set at {address:#x} ({kind})");
        Ok(id)
    }

    /// Clear a breakpoint, restoring the original instruction byte exactly.
    pub fn clear_breakpoint(&mut self, id: TrapId) -> Result<()> {
        self.ensure_attached("clear_breakpoint")?;
        self.disarm_breakpoint(id)?;
        self.traps.breakpoints.remove(&id);
        log::debug!("breakpoint {id} cleared");
        Ok(())
    }

    pub fn disable_breakpoint(&mut self, id: TrapId) -> Result<()> {
        self.ensure_attached("disable_breakpoint")?;
        self.disarm_breakpoint(id)?;
        if let Some(bp) = self.traps.breakpoint_mut(id) {
            bp.enabled = false;
        }
        Ok(())
    }

    pub fn enable_breakpoint(&mut self, id: TrapId) -> Result<()> {
        self.ensure_attached("enable_breakpoint")?;
        let bp = self
            .traps
            .breakpoint(id)
            .ok_or(DebugError::UnknownId { id })?
            .clone();
        if bp.enabled {
            return Ok(());
        }
        self.traps.check_unique(bp.address, bp.kind)?;
        match bp.kind {
            BreakpointKind::Software => {
                let mut orig = [0u8; 1];
                self.backend.read_memory(bp.address, &mut orig)?;
                self.backend.write_memory(bp.address, &[TRAP_OPCODE])?;
                if let Some(rec) = self.traps.breakpoint_mut(id) {
                    rec.saved_byte = Some(orig[0]);
                    rec.enabled = true;
                }
            }
            BreakpointKind::Hardware => {
                let slot = self.traps.alloc_slot(id)?;
                self.backend
                    .set_hw_slot(slot, HwSlotSpec::Execute { address: bp.address })?;
                if let Some(rec) = self.traps.breakpoint_mut(id) {
                    rec.hw_slot = Some(slot);
                    rec.enabled = true;
                }
            }
        }
        Ok(())
    }

    /// Un-arm a breakpoint on the target without forgetting its record.
    fn disarm_breakpoint(&mut self, id: TrapId) -> Result<()> {
        let bp = self
            .traps
            .breakpoint(id)
            .ok_or(DebugError::UnknownId { id })?
            .clone();
        if !bp.enabled {
            return Ok(());
        }
        match bp.kind {
            BreakpointKind::Software => {
                if let Some(orig) = bp.saved_byte {
                    self.backend.write_memory(bp.address, &[orig])?;
                }
            }
            BreakpointKind::Hardware => {
                if let Some(slot) = bp.hw_slot {
                    self.backend.clear_hw_slot(slot)?;
                    self.traps.release_slot(slot);
                }
            }
        }
        Ok(())
    }

    /// Drop a breakpoint record without touching the target. Used after the
    /// target exited or during forced teardown.
    pub(crate) fn forget_breakpoint(&mut self, id: TrapId) {
        if let Some(bp) = self.traps.breakpoints.remove(&id) {
            if let Some(slot) = bp.hw_slot {
                self.traps.release_slot(slot);
            }
        }
    }

    /// Set a watchpoint on `[address, address + len)`.
    pub fn set_watchpoint(&mut self, address: u64, len: u64, access: WatchAccess) -> Result<TrapId> {
        self.ensure_attached("set_watchpoint")?;
        self.ensure_stopped("set_watchpoint")?;
        if len == 0 || !self.memory_map.contains_range(address, len) {
            return Err(DebugError::InvalidAddress { address });
        }
        let id = self.traps.alloc_id();
        let slot = self.traps.alloc_slot(id)?;
        if let Err(e) = self.backend.set_hw_slot(
            slot,
            HwSlotSpec::Access {
                address,
                len,
                access,
            },
        ) {
            self.traps.release_slot(slot);
            return Err(e);
        }
        self.traps.watchpoints.insert(
            id,
            Watchpoint {
                id,
                address,
                len,
                access,
                enabled: true,
                hit_count: 0,
                hw_slot: slot,
            },
        );
        log::debug!("watchpoint {id} set at {address:#x}+{len} ({access})");
        Ok(id)
    }

    pub fn clear_watchpoint(&mut self, id: TrapId) -> Result<()> {
        self.ensure_attached("clear_watchpoint")?;
        let wp = self
            .traps
            .watchpoint(id)
            .ok_or(DebugError::UnknownId { id })?
            .clone();
        if wp.enabled {
            self.backend.clear_hw_slot(wp.hw_slot)?;
        }
        self.traps.release_slot(wp.hw_slot);
        self.traps.watchpoints.remove(&id);
        log::debug!("watchpoint {id} cleared");
        Ok(())
    }

    /// Clear a trap by id, whichever table it lives in.
    pub fn clear_trap(&mut self, id: TrapId) -> Result<()> {
        if self.traps.breakpoint(id).is_some() {
            self.clear_breakpoint(id)
        } else if self.traps.watchpoint(id).is_some() {
            self.clear_watchpoint(id)
        } else {
            Err(DebugError::UnknownId { id })
        }
    }

    pub fn traps(&self) -> &TrapStore {
        &self.traps
    }
}
