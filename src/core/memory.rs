//! Target memory layout
//!
//! Read-only view of the target's mapped regions, snapshotted on attach and
//! refreshed after mapping-changing events. All address validation for
//! memory operations goes through [`MemoryMap`].

use std::fmt;
use std::str::FromStr;

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const R: Self = Self {
        read: true,
        write: false,
        execute: false,
    };
    pub const RX: Self = Self {
        read: true,
        write: false,
        execute: true,
    };
    pub const RW: Self = Self {
        read: true,
        write: true,
        execute: false,
    };
    pub const RWX: Self = Self {
        read: true,
        write: true,
        execute: true,
    };
    pub const NONE: Self = Self {
        read: false,
        write: false,
        execute: false,
    };
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
        )
    }
}

impl FromStr for Protection {
    type Err = String;

    /// Parses the `/proc/<pid>/maps` style `rwx` triplet (a trailing
    /// private/shared flag is accepted and ignored).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = s.as_bytes();
        if b.len() < 3 {
            return Err(format!("bad protection string: {s:?}"));
        }
        let flag = |c: u8, on: u8| -> Result<bool, String> {
            if c == on {
                Ok(true)
            } else if c == b'-' {
                Ok(false)
            } else {
                Err(format!("bad protection string: {s:?}"))
            }
        };
        Ok(Protection {
            read: flag(b[0], b'r')?,
            write: flag(b[1], b'w')?,
            execute: flag(b[2], b'x')?,
        })
    }
}

/// One mapped region of the target address space
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// Start address of the region
    pub base: u64,
    /// Size of the region in bytes
    pub len: u64,
    /// Protection flags
    pub protection: Protection,
    /// Optional name (e.g. module path, "[stack]", "[heap]")
    pub name: Option<String>,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        len <= self.len && self.contains(addr) && addr.saturating_add(len) <= self.end()
    }
}

/// Snapshot of the full target memory map
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    pub fn new(mut regions: Vec<MemoryRegion>) -> Self {
        regions.sort_by_key(|r| r.base);
        Self { regions }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn region_at(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.region_at(addr).is_some()
    }

    /// True when the whole `[addr, addr + len)` range lies inside one region.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        self.regions.iter().any(|r| r.contains_range(addr, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> MemoryMap {
        MemoryMap::new(vec![
            MemoryRegion {
                base: 0x7000_0000,
                len: 0x1000,
                protection: Protection::RW,
                name: Some("[stack]".into()),
            },
            MemoryRegion {
                base: 0x1000,
                len: 0x100,
                protection: Protection::RX,
                name: None,
            },
        ])
    }

    #[test]
    fn region_lookup_spans_exact_bounds() {
        let m = map();
        assert!(m.contains(0x1000));
        assert!(m.contains(0x10ff));
        assert!(!m.contains(0x1100));
        assert!(m.contains_range(0x1000, 0x100));
        assert!(!m.contains_range(0x10f0, 0x20));
    }

    #[test]
    fn protection_round_trips_through_display() {
        for s in ["rwx", "r-x", "rw-", "---", "r--"] {
            let p: Protection = s.parse().unwrap();
            assert_eq!(p.to_string(), s);
        }
        assert!("zz".parse::<Protection>().is_err());
        // maps-style trailing flag is tolerated
        let p: Protection = "r-xp".parse().unwrap();
        assert_eq!(p, Protection::RX);
    }
}
