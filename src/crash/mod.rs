//! Crash analyzer
//!
//! Deterministic triage of a faulted target, live or from a stored dump.
//! Classification is a fixed decision table over extracted fault features;
//! the same dump always yields the same report, so triage results can be
//! diffed across runs and machines.

pub mod dump;

use std::fmt;

use colored::Colorize;

use crate::analysis::disasm::{self, Op};
use crate::analysis::unwind::{self, Backtrace};
use crate::core::error::Result;
use crate::core::session::Session;
use crate::crash::dump::{DumpMemory, StoredDump};
use crate::debug::FaultKind;

/// Triage verdict, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Exploitability {
    Unknown,
    ProbablyNotExploitable,
    ProbablyExploitable,
    Exploitable,
}

impl fmt::Display for Exploitability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Exploitability::Unknown => "unknown",
            Exploitability::ProbablyNotExploitable => "probably not exploitable",
            Exploitability::ProbablyExploitable => "probably exploitable",
            Exploitability::Exploitable => "exploitable",
        };
        write!(f, "{s}")
    }
}

/// Facts extracted from the fault, inputs to the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultFeatures {
    /// The program counter itself carries an attacker-pattern value.
    pub controlled_pc: bool,
    /// The faulting access target carries an attacker-pattern value.
    pub controlled_target: bool,
    /// The faulting instruction writes memory.
    pub is_write: bool,
    /// The frame-pointer chain is broken at the fault point.
    pub stack_corruption: bool,
    /// Hardening observed in the memory image (currently: no W+X region).
    pub mitigations_present: bool,
}

/// Skeleton reproduction recipe emitted for the exploitable classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PocSketch {
    pub fault_address: u64,
    pub pattern: u32,
    pub description: String,
}

/// Full triage output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub exploitability: Exploitability,
    pub fault_kind: FaultKind,
    pub fault_address: u64,
    pub pc: u64,
    pub features: FaultFeatures,
    pub mitigations: Vec<String>,
    pub backtrace: Backtrace,
    pub notes: Vec<String>,
    pub poc: Option<PocSketch>,
}

impl CrashReport {
    /// Human-readable triage summary for the REPL.
    pub fn render(&self) -> String {
        let verdict = match self.exploitability {
            Exploitability::Exploitable => self.exploitability.to_string().red().bold(),
            Exploitability::ProbablyExploitable => self.exploitability.to_string().yellow().bold(),
            _ => self.exploitability.to_string().normal(),
        };
        let mut out = format!(
            "{} {} at pc {:#x}, address {:#x}\nverdict: {verdict}\n",
            "crash:".red().bold(),
            self.fault_kind,
            self.pc,
            self.fault_address,
        );
        for note in &self.notes {
            out.push_str(&format!("  - {note}\n"));
        }
        if !self.mitigations.is_empty() {
            out.push_str(&format!("  mitigations: {}\n", self.mitigations.join(", ")));
        }
        for frame in &self.backtrace.frames {
            out.push_str(&format!("  {frame}\n"));
        }
        if self.backtrace.corrupt {
            out.push_str("  (frame chain broken)\n");
        }
        if let Some(poc) = &self.poc {
            out.push_str(&format!("  poc: {}\n", poc.description));
        }
        out
    }
}

/// True for values shaped like a cyclic input pattern: all four low bytes
/// equal and ASCII alphanumeric (the classic 0x41414141 signature).
fn value_looks_controlled(value: u64) -> bool {
    let b = (value & 0xff) as u8;
    let low = (value & 0xffff_ffff) as u32;
    low == u32::from_le_bytes([b, b, b, b]) && b.is_ascii_alphanumeric()
}

/// The fixed decision table. Row order is the precedence order.
fn classify(kind: FaultKind, f: &FaultFeatures) -> Exploitability {
    if f.controlled_pc {
        return Exploitability::Exploitable;
    }
    if f.is_write && f.controlled_target {
        return Exploitability::Exploitable;
    }
    if !f.is_write && f.controlled_target {
        return Exploitability::ProbablyExploitable;
    }
    if f.stack_corruption {
        return if f.mitigations_present {
            Exploitability::ProbablyNotExploitable
        } else {
            Exploitability::ProbablyExploitable
        };
    }
    match kind {
        FaultKind::Segfault | FaultKind::BusError => Exploitability::ProbablyNotExploitable,
        FaultKind::IllegalInstruction => Exploitability::ProbablyExploitable,
        FaultKind::DivideByZero => Exploitability::ProbablyNotExploitable,
    }
}

/// Analyze a stored dump. Pure: no session, no target, no ambient state.
pub fn analyze_dump(dump: &StoredDump) -> Result<CrashReport> {
    let insn_bytes = dump.instruction_bytes()?;
    let decoded = disasm::decode(&insn_bytes, dump.pc).ok();
    let is_write = matches!(
        decoded.as_ref().map(|i| i.op),
        Some(Op::Store { .. } | Op::Call { .. } | Op::Enter)
    );

    let fp = dump.register("fp").unwrap_or(0);
    let backtrace = unwind::walk(&mut DumpMemory(dump), dump.pc, fp, unwind::MAX_FRAMES);

    let mut mitigations = Vec::new();
    let wx = dump.regions.iter().any(|r| {
        r.protection
            .parse::<crate::core::memory::Protection>()
            .map(|p| p.write && p.execute)
            .unwrap_or(false)
    });
    if !wx {
        mitigations.push("nx".to_string());
    }

    let features = FaultFeatures {
        controlled_pc: value_looks_controlled(dump.pc)
            || (dump.fault_kind == FaultKind::Segfault && dump.pc == dump.fault_address),
        controlled_target: value_looks_controlled(dump.fault_address),
        is_write,
        stack_corruption: backtrace.corrupt,
        mitigations_present: !mitigations.is_empty(),
    };
    let exploitability = classify(dump.fault_kind, &features);

    let mut notes = Vec::new();
    if features.controlled_pc {
        notes.push("program counter appears attacker-controlled".to_string());
    }
    if features.controlled_target {
        notes.push(format!(
            "faulting {} target {:#x} matches an input pattern",
            if is_write { "write" } else { "read" },
            dump.fault_address
        ));
    }
    if features.stack_corruption {
        notes.push("frame-pointer chain is corrupted".to_string());
    }
    match &decoded {
        Some(insn) => notes.push(format!("faulting instruction: {}", insn.format_full())),
        None => notes.push("faulting instruction bytes do not decode".to_string()),
    }

    let poc = (exploitability >= Exploitability::ProbablyExploitable).then(|| PocSketch {
        fault_address: dump.fault_address,
        pattern: 0x4141_4141,
        description: format!(
            "drive the faulting access target to a mapped, attacker-chosen \
             address in place of {:#x}",
            dump.fault_address
        ),
    });

    log::info!(
        "crash triage: {} fault at {:#x} classified {}",
        dump.fault_kind,
        dump.fault_address,
        exploitability
    );
    Ok(CrashReport {
        exploitability,
        fault_kind: dump.fault_kind,
        fault_address: dump.fault_address,
        pc: dump.pc,
        features,
        mitigations,
        backtrace,
        notes,
        poc,
    })
}

impl Session {
    /// Analyze the most recent unhandled fault of this session. Captures a
    /// dump first so the live path and the offline path share one pipeline.
    pub fn analyze_crash(&mut self) -> Result<CrashReport> {
        let dump = StoredDump::capture(self)?;
        analyze_dump(&dump)
    }

    /// Capture the most recent fault as a storable dump.
    pub fn capture_dump(&mut self) -> Result<StoredDump> {
        StoredDump::capture(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::disasm::Op;
    use crate::debug::sim::{SimTarget, DATA_BASE, STACK_BASE};

    fn fault_dump(ops: &[Op]) -> StoredDump {
        let mut s = Session::attach(Box::new(SimTarget::with_program(ops))).unwrap();
        s.resume().unwrap();
        StoredDump::capture(&mut s).unwrap()
    }

    #[test]
    fn pattern_read_is_probably_exploitable() {
        let dump = fault_dump(&[Op::Load {
            dst: 0,
            addr: 0x4141_4141,
        }]);
        let report = analyze_dump(&dump).unwrap();
        assert_eq!(report.exploitability, Exploitability::ProbablyExploitable);
        assert!(report.features.controlled_target);
        assert!(!report.features.is_write);
        assert!(report.poc.is_some());
    }

    #[test]
    fn pattern_write_is_exploitable() {
        let dump = fault_dump(&[
            Op::MovImm { dst: 0, imm: 7 },
            Op::Store {
                addr: 0x4242_4242,
                src: 0,
            },
        ]);
        let report = analyze_dump(&dump).unwrap();
        assert_eq!(report.exploitability, Exploitability::Exploitable);
        assert!(report.features.is_write);
    }

    #[test]
    fn plain_wild_read_is_probably_not_exploitable() {
        // 0xdead0000 has unequal low bytes, so it is not a pattern value
        let dump = fault_dump(&[Op::Load {
            dst: 0,
            addr: 0xdead_0000,
        }]);
        let report = analyze_dump(&dump).unwrap();
        assert_eq!(
            report.exploitability,
            Exploitability::ProbablyNotExploitable
        );
    }

    #[test]
    fn jump_to_pattern_address_is_exploitable() {
        let dump = fault_dump(&[Op::Jmp {
            target: 0x4141_4141,
        }]);
        let report = analyze_dump(&dump).unwrap();
        assert_eq!(report.exploitability, Exploitability::Exploitable);
        assert!(report.features.controlled_pc);
    }

    #[test]
    fn triage_is_deterministic() {
        let mk = || {
            let dump = fault_dump(&[Op::Load {
                dst: 0,
                addr: 0x4141_4141,
            }]);
            (dump.to_json().unwrap(), analyze_dump(&dump).unwrap())
        };
        let (json_a, report_a) = mk();
        let (json_b, report_b) = mk();
        assert_eq!(json_a, json_b);
        assert_eq!(report_a, report_b);
    }

    #[test]
    fn live_and_dump_paths_agree() {
        let mut s = Session::attach(Box::new(SimTarget::with_program(&[Op::Load {
            dst: 0,
            addr: 0x4141_4141,
        }])))
        .unwrap();
        s.resume().unwrap();
        let live = s.analyze_crash().unwrap();
        let dump = s.capture_dump().unwrap();
        let offline = analyze_dump(&dump).unwrap();
        assert_eq!(live, offline);
    }

    #[test]
    fn value_pattern_heuristic() {
        assert!(value_looks_controlled(0x4141_4141));
        assert!(value_looks_controlled(0x6161_6161));
        assert!(value_looks_controlled(0x3131_3131));
        assert!(!value_looks_controlled(0x4141_4142));
        assert!(!value_looks_controlled(0x0000_0000));
        assert!(!value_looks_controlled(0x2e2e_2e2e)); // punctuation
    }

    #[test]
    fn corrupted_frame_chain_downgrades_with_mitigations() {
        // overwrite the saved frame pointer, then fault inside the callee
        let f = crate::debug::sim::CODE_BASE + 10;
        let mut s = Session::attach(Box::new(SimTarget::with_program(&[
            Op::Call { target: f },
            Op::Halt,
            // f:
            Op::Enter,
            Op::MovImm { dst: 7, imm: 1 },
            Op::Load {
                dst: 0,
                addr: DATA_BASE + 0xfff9, // unmapped, unpatterned
            },
        ])))
        .unwrap();
        // clobber the saved fp so the chain runs backwards
        let ev = s.resume().unwrap();
        assert!(matches!(
            ev.reason,
            crate::core::session::StopReason::Signal(_)
        ));
        let regs = s.registers_current().unwrap();
        let fp = regs.fp();
        assert!(fp >= STACK_BASE);
        s.write_memory(fp, &(fp - 0x100).to_le_bytes()).unwrap();
        let report = s.analyze_crash().unwrap();
        assert!(report.features.stack_corruption);
        // the image has no W+X region, so nx is in force
        assert_eq!(
            report.exploitability,
            Exploitability::ProbablyNotExploitable
        );
    }
}
