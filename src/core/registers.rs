//! Register snapshots
//!
//! Register state crosses two very different backends (a simulated machine
//! and a native ptrace target), so the snapshot is name-indexed rather than
//! a fixed struct. The map is ordered to keep register dumps and crash
//! reports byte-stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Canonical program counter name.
pub const REG_PC: &str = "pc";
/// Canonical stack pointer name.
pub const REG_SP: &str = "sp";
/// Canonical frame pointer name.
pub const REG_FP: &str = "fp";

/// One register that changed between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDelta {
    pub name: String,
    pub old: u64,
    pub new: u64,
}

/// A full register snapshot for one thread.
///
/// Backends must always publish the canonical `pc`/`sp`/`fp` names in
/// addition to whatever architecture-specific names they carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSet {
    regs: BTreeMap<String, u64>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.regs.get(name).copied()
    }

    pub fn set(&mut self, name: &str, value: u64) {
        self.regs.insert(name.to_string(), value);
    }

    pub fn pc(&self) -> u64 {
        self.get(REG_PC).unwrap_or(0)
    }

    pub fn set_pc(&mut self, value: u64) {
        self.set(REG_PC, value);
    }

    pub fn sp(&self) -> u64 {
        self.get(REG_SP).unwrap_or(0)
    }

    pub fn set_sp(&mut self, value: u64) {
        self.set(REG_SP, value);
    }

    pub fn fp(&self) -> u64 {
        self.get(REG_FP).unwrap_or(0)
    }

    pub fn set_fp(&mut self, value: u64) {
        self.set(REG_FP, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.regs.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Registers whose value differs from `before`, in name order.
    pub fn diff(&self, before: &RegisterSet) -> Vec<RegisterDelta> {
        let mut out = Vec::new();
        for (name, new) in self.iter() {
            let old = before.get(name).unwrap_or(0);
            if old != new {
                out.push(RegisterDelta {
                    name: name.to_string(),
                    old,
                    new,
                });
            }
        }
        out
    }

    pub fn as_map(&self) -> &BTreeMap<String, u64> {
        &self.regs
    }
}

impl From<BTreeMap<String, u64>> for RegisterSet {
    fn from(regs: BTreeMap<String, u64>) -> Self {
        Self { regs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_changed_registers_in_order() {
        let mut before = RegisterSet::new();
        before.set("r0", 1);
        before.set("r1", 2);
        before.set_pc(0x1000);

        let mut after = before.clone();
        after.set("r1", 7);
        after.set_pc(0x100a);

        let deltas = after.diff(&before);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].name, "pc");
        assert_eq!(deltas[0].new, 0x100a);
        assert_eq!(deltas[1].name, "r1");
        assert_eq!(deltas[1].old, 2);
    }

    #[test]
    fn canonical_accessors_default_to_zero() {
        let regs = RegisterSet::new();
        assert_eq!(regs.pc(), 0);
        assert_eq!(regs.sp(), 0);
        assert_eq!(regs.fp(), 0);
    }
}
