//! Target backends
//!
//! Everything that actually touches a target lives behind [`TargetBackend`]:
//! the deterministic simulator used by tests and offline analysis, and the
//! ptrace backend for live Linux processes. Backends report only mechanical
//! stop facts ([`RawStopEvent`]); trap identification, conditions, and hook
//! dispatch are decided above, in the execution control layer.

pub mod sim;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::memory::MemoryRegion;
use crate::core::registers::RegisterSet;

/// Target thread identifier.
pub type ThreadId = u64;

/// Number of hardware debug-register slots. Fixed at four, matching the
/// x86 DR0-DR3 convention.
pub const HW_SLOT_COUNT: usize = 4;

/// Access kinds a watchpoint can fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAccess {
    Read,
    Write,
    ReadWrite,
}

impl WatchAccess {
    pub fn matches_write(self, is_write: bool) -> bool {
        match self {
            WatchAccess::Read => !is_write,
            WatchAccess::Write => is_write,
            WatchAccess::ReadWrite => true,
        }
    }
}

impl fmt::Display for WatchAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchAccess::Read => write!(f, "r"),
            WatchAccess::Write => write!(f, "w"),
            WatchAccess::ReadWrite => write!(f, "rw"),
        }
    }
}

impl FromStr for WatchAccess {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "r" => Ok(WatchAccess::Read),
            "w" => Ok(WatchAccess::Write),
            "rw" => Ok(WatchAccess::ReadWrite),
            other => Err(format!("bad access spec {other:?}, expected r|w|rw")),
        }
    }
}

/// What one hardware debug-register slot is armed to catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwSlotSpec {
    /// Instruction fetch at `address` (hardware breakpoint).
    Execute { address: u64 },
    /// Data access inside `[address, address + len)` (watchpoint).
    Access {
        address: u64,
        len: u64,
        access: WatchAccess,
    },
}

/// Hardware fault classes a target can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Segfault,
    IllegalInstruction,
    BusError,
    DivideByZero,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Segfault => "segfault",
            FaultKind::IllegalInstruction => "illegal_instruction",
            FaultKind::BusError => "bus_error",
            FaultKind::DivideByZero => "divide_by_zero",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FaultKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "segfault" => Ok(FaultKind::Segfault),
            "illegal_instruction" => Ok(FaultKind::IllegalInstruction),
            "bus_error" => Ok(FaultKind::BusError),
            "divide_by_zero" => Ok(FaultKind::DivideByZero),
            other => Err(format!("unknown fault kind {other:?}")),
        }
    }
}

/// Signal-class stop reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Out-of-band cancellation requested by the controlling context.
    Interrupt,
    /// Initial attach stop or an explicit suspend.
    Stop,
    /// A backend error forced the state machine into a safe stop.
    InternalError,
    /// Unhandled hardware fault; the crash analyzer can pick this up live.
    Fault(FaultKind),
    /// Any other OS signal, by number.
    Os(i32),
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Interrupt => write!(f, "interrupt"),
            StopSignal::Stop => write!(f, "stop"),
            StopSignal::InternalError => write!(f, "internal-error"),
            StopSignal::Fault(k) => write!(f, "fault({k})"),
            StopSignal::Os(n) => write!(f, "signal({n})"),
        }
    }
}

/// Mechanical stop facts reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStopEvent {
    /// Hit a software trap opcode. `pc` is the trap address itself.
    Trap { tid: ThreadId, pc: u64 },
    /// A hardware debug-register slot fired.
    HwSlot {
        tid: ThreadId,
        slot: usize,
        pc: u64,
        access_address: u64,
    },
    /// One instruction retired after a single-step request.
    SingleStep { tid: ThreadId, pc: u64 },
    /// Stopped by a signal that is not a trap.
    Signal {
        tid: ThreadId,
        signal: StopSignal,
        pc: u64,
    },
    /// Unhandled hardware fault.
    Fault {
        tid: ThreadId,
        pc: u64,
        kind: FaultKind,
        address: u64,
    },
    /// The target exited.
    Exited { code: i64 },
}

/// The one contract every target implementation satisfies.
///
/// All blocking calls ([`resume`](TargetBackend::resume)) must honor the
/// shared interrupt flag: when it is raised the backend forces the target to
/// a stop and reports it, rather than blocking indefinitely.
pub trait TargetBackend {
    fn pid(&self) -> u32;

    /// Current memory map; queried on attach and after mapping changes.
    fn memory_map(&mut self) -> Result<Vec<MemoryRegion>>;

    /// Live thread ids, stable while the target is stopped.
    fn threads(&mut self) -> Result<Vec<ThreadId>>;

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    fn read_registers(&mut self, tid: ThreadId) -> Result<RegisterSet>;

    fn write_registers(&mut self, tid: ThreadId, regs: &RegisterSet) -> Result<()>;

    /// Arm one hardware debug-register slot.
    fn set_hw_slot(&mut self, slot: usize, spec: HwSlotSpec) -> Result<()>;

    fn clear_hw_slot(&mut self, slot: usize) -> Result<()>;

    /// Resume the target and block until it reports a stop.
    fn resume(&mut self) -> Result<RawStopEvent>;

    /// Execute exactly one instruction on `tid` and report the stop.
    fn single_step(&mut self, tid: ThreadId) -> Result<RawStopEvent>;

    /// The out-of-band cancellation flag shared with the controlling context.
    fn interrupt_flag(&self) -> Arc<AtomicBool>;

    /// Release the target. Trap cleanup has already happened above.
    fn detach(&mut self) -> Result<()>;
}
