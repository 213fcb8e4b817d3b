//! Static analysis over target memory: disassembly and stack unwinding.

pub mod disasm;
pub mod unwind;
