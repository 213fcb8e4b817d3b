//! Rift - interactive debugging and dynamic analysis engine
//!
//! One [`Session`] per attached target; everything else hangs off it:
//! breakpoints and watchpoints, run control, disassembly, unwinding,
//! hooks and tracing, and crash triage. Targets are pluggable behind
//! [`TargetBackend`]: a deterministic in-process simulator and, on
//! x86_64 Linux, a live ptrace backend.

pub mod analysis;
pub mod core;
pub mod crash;
pub mod debug;
pub mod instrument;
pub mod ui;

pub use crate::core::breakpoint::{BreakpointKind, Condition, TrapId};
pub use crate::core::error::{DebugError, Result};
pub use crate::core::session::{Session, SessionState, StopEvent, StopReason};
pub use crate::crash::{analyze_dump, CrashReport, Exploitability};
pub use crate::debug::{RawStopEvent, StopSignal, TargetBackend, WatchAccess};
pub use crate::instrument::{HookVerdict, TraceLog};
