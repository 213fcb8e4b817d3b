//! Engine core: session lifecycle, traps, and the execution state machine.

pub mod breakpoint;
pub mod error;
pub mod execution;
pub mod memory;
pub mod registers;
pub mod session;
