//! Stack unwinder
//!
//! Frame-pointer chain walker. The frame layout is fixed by the reference
//! ABI: `[fp]` holds the caller's saved frame pointer and `[fp + 8]` the
//! return address. The walker reads through a [`MemorySource`] so it runs
//! identically against a live target and a stored crash dump.

use std::fmt;

use crate::core::error::Result;
use crate::core::session::Session;

/// Hard cap applied when the caller does not pass a tighter one. A chain
/// longer than this is a cycle or corruption, not a real call stack.
pub const MAX_FRAMES: usize = 256;

/// Word reads for the unwinder. Implementors return an error for addresses
/// they cannot service; the walker treats that as the end of the chain.
pub trait MemorySource {
    fn read_u64(&mut self, address: u64) -> Result<u64>;
}

impl MemorySource for Session {
    fn read_u64(&mut self, address: u64) -> Result<u64> {
        self.backend_read_u64(address)
    }
}

/// Address-range symbol table, populated by the caller (load-time metadata
/// or user definitions). Lookup is by containment.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    entries: Vec<Symbol>,
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    low: u64,
    high: u64,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define `name` as covering `[low, high)`. Later definitions win on
    /// overlap.
    pub fn define(&mut self, name: &str, low: u64, high: u64) {
        self.entries.push(Symbol {
            name: name.to_string(),
            low,
            high,
        });
    }

    pub fn resolve(&self, address: u64) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|s| s.low <= address && address < s.high)
            .map(|s| s.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One unwound frame. Frame 0 is the stop location itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: usize,
    pub pc: u64,
    pub fp: u64,
    pub symbol: Option<String>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(name) => write!(f, "#{:<3} {:#012x} in {}", self.index, self.pc, name),
            None => write!(f, "#{:<3} {:#012x}", self.index, self.pc),
        }
    }
}

/// Result of a chain walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    pub frames: Vec<Frame>,
    /// The frame budget ran out before the chain ended.
    pub truncated: bool,
    /// The chain broke: a frame pointer was unreadable or ran backwards.
    pub corrupt: bool,
}

/// Walk the frame chain starting from `pc`/`fp`. Never fails: a broken
/// chain ends the walk and is reported in the `corrupt` flag, so a crashed
/// target still yields the frames that could be recovered.
pub fn walk(mem: &mut dyn MemorySource, pc: u64, fp: u64, max_frames: usize) -> Backtrace {
    let max = max_frames.min(MAX_FRAMES).max(1);
    let mut frames = vec![Frame {
        index: 0,
        pc,
        fp,
        symbol: None,
    }];
    let mut truncated = false;
    let mut corrupt = false;

    let mut cur_fp = fp;
    // fp == 0 is the sentinel planted before the outermost frame
    while cur_fp != 0 {
        if frames.len() >= max {
            truncated = true;
            break;
        }
        let ret = match mem.read_u64(cur_fp + 8) {
            Ok(v) => v,
            Err(_) => {
                corrupt = true;
                break;
            }
        };
        let saved_fp = match mem.read_u64(cur_fp) {
            Ok(v) => v,
            Err(_) => {
                corrupt = true;
                break;
            }
        };
        // the stack grows down, so each caller frame sits above the callee
        if saved_fp != 0 && saved_fp <= cur_fp {
            corrupt = true;
            break;
        }
        frames.push(Frame {
            index: frames.len(),
            pc: ret,
            fp: saved_fp,
            symbol: None,
        });
        cur_fp = saved_fp;
    }

    Backtrace {
        frames,
        truncated,
        corrupt,
    }
}

impl Session {
    /// Backtrace of the current thread at its stop location.
    pub fn backtrace(&mut self, max_frames: usize) -> Result<Backtrace> {
        self.ensure_attached("backtrace")?;
        self.ensure_stopped("backtrace")?;
        let regs = self.registers_current()?;
        let mut bt = walk(self, regs.pc(), regs.fp(), max_frames);
        for frame in &mut bt.frames {
            frame.symbol = self.symbols().resolve(frame.pc).map(String::from);
        }
        Ok(bt)
    }
}
