//! Stored crash dumps
//!
//! Self-contained JSON snapshot of a faulted target: fault facts, register
//! file, and the raw bytes of every captured region. A dump loads back into
//! the same analysis pipeline that runs live, so triage works long after the
//! process is gone.
//!
//! Loading fails closed: any malformed field, missing key, or undecodable
//! hex is [`DebugError::CorruptArtifact`], never a partially-populated dump.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::disasm::MAX_INSN_LEN;
use crate::analysis::unwind::MemorySource;
use crate::core::error::{DebugError, Result};
use crate::core::memory::Protection;
use crate::core::session::Session;
use crate::debug::{FaultKind, ThreadId};

/// Bumped when the on-disk layout changes incompatibly.
pub const DUMP_FORMAT_VERSION: u32 = 1;

/// One captured region. `data` is lowercase hex of the region bytes;
/// externally authored artifacts may carry layout only, leaving it empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRegion {
    pub base: u64,
    pub len: u64,
    #[serde(rename = "permissions", alias = "protection")]
    pub protection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

/// A stored crash dump. Field order and the `BTreeMap` register file make
/// serialization byte-stable, so identical crashes produce identical files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDump {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub thread_id: ThreadId,
    pub fault_kind: FaultKind,
    pub fault_address: u64,
    /// Derived from `registers["pc"]` when the artifact omits it.
    #[serde(default)]
    pub pc: u64,
    /// Hex bytes of the faulting instruction window, trap patches undone.
    #[serde(
        rename = "faulting_instruction_bytes",
        alias = "faulting_instruction"
    )]
    pub faulting_instruction: String,
    pub registers: BTreeMap<String, u64>,
    #[serde(rename = "memory_regions", alias = "regions")]
    pub regions: Vec<DumpRegion>,
}

fn default_format_version() -> u32 {
    DUMP_FORMAT_VERSION
}

impl StoredDump {
    /// Snapshot the faulted session. Fails with a state violation when the
    /// session has no recorded fault.
    pub fn capture(session: &mut Session) -> Result<Self> {
        let fault = session
            .last_fault()
            .ok_or(DebugError::StateViolation {
                operation: "capture_dump",
                state: "no fault recorded".into(),
            })?;
        let registers = session.registers(fault.tid)?.as_map().clone();

        let mut insn_window = Vec::new();
        if let Some(region) = session.memory_map().region_at(fault.pc).cloned() {
            let avail = ((region.end() - fault.pc) as usize).min(MAX_INSN_LEN);
            let mut bytes = session.read_memory(fault.pc, avail)?;
            // undo our own trap patches so the dump holds the real program
            for bp in session.traps().breakpoints() {
                if bp.enabled && bp.address >= fault.pc {
                    let off = (bp.address - fault.pc) as usize;
                    if off < bytes.len() {
                        if let Some(orig) = bp.saved_byte {
                            bytes[off] = orig;
                        }
                    }
                }
            }
            insn_window = bytes;
        }

        let mut regions = Vec::new();
        for region in session.memory_map().regions().to_vec() {
            let bytes = session.read_memory(region.base, region.len as usize)?;
            regions.push(DumpRegion {
                base: region.base,
                len: region.len,
                protection: region.protection.to_string(),
                name: region.name.clone(),
                data: hex::encode(bytes),
            });
        }

        Ok(StoredDump {
            format_version: DUMP_FORMAT_VERSION,
            thread_id: fault.tid,
            fault_kind: fault.kind,
            fault_address: fault.address,
            pc: fault.pc,
            faulting_instruction: hex::encode(insn_window),
            registers,
            regions,
        })
    }

    /// Serialize to the canonical on-disk form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| DebugError::CorruptArtifact {
            reason: format!("failed to serialize dump: {e}"),
        })
    }

    /// Parse and validate a dump. Every validation failure is
    /// [`DebugError::CorruptArtifact`].
    pub fn from_json(text: &str) -> Result<Self> {
        let mut dump: StoredDump =
            serde_json::from_str(text).map_err(|e| DebugError::CorruptArtifact {
                reason: format!("malformed dump: {e}"),
            })?;
        if dump.pc == 0 {
            if let Some(&pc) = dump.registers.get("pc") {
                dump.pc = pc;
            }
        }
        dump.validate()?;
        Ok(dump)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.to_json()?;
        fs::write(path, text).map_err(|e| DebugError::CorruptArtifact {
            reason: format!("failed to write {}: {e}", path.display()),
        })?;
        log::info!("crash dump written to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DebugError::CorruptArtifact {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.format_version != DUMP_FORMAT_VERSION {
            return Err(DebugError::CorruptArtifact {
                reason: format!(
                    "unsupported dump format version {} (expected {DUMP_FORMAT_VERSION})",
                    self.format_version
                ),
            });
        }
        hex::decode(&self.faulting_instruction).map_err(|e| DebugError::CorruptArtifact {
            reason: format!("bad faulting_instruction hex: {e}"),
        })?;
        for region in &self.regions {
            let bytes = hex::decode(&region.data).map_err(|e| DebugError::CorruptArtifact {
                reason: format!("bad region data hex at {:#x}: {e}", region.base),
            })?;
            if !bytes.is_empty() && bytes.len() as u64 != region.len {
                return Err(DebugError::CorruptArtifact {
                    reason: format!(
                        "region at {:#x} declares len {} but carries {} byte(s)",
                        region.base,
                        region.len,
                        bytes.len()
                    ),
                });
            }
            region
                .protection
                .parse::<Protection>()
                .map_err(|e| DebugError::CorruptArtifact {
                    reason: format!("bad protection at {:#x}: {e}", region.base),
                })?;
        }
        Ok(())
    }

    /// Decoded bytes of the faulting instruction window.
    pub fn instruction_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.faulting_instruction).map_err(|e| DebugError::CorruptArtifact {
            reason: format!("bad faulting_instruction hex: {e}"),
        })
    }

    pub fn register(&self, name: &str) -> Option<u64> {
        self.registers.get(name).copied()
    }

    /// Protection flags of the captured region containing `addr`.
    pub fn protection_at(&self, addr: u64) -> Option<Protection> {
        self.region_containing(addr)
            .and_then(|r| r.protection.parse().ok())
    }

    fn region_containing(&self, addr: u64) -> Option<&DumpRegion> {
        self.regions
            .iter()
            .find(|r| addr >= r.base && addr < r.base + r.len)
    }

    /// Little-endian word read from the captured image.
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let region = self
            .region_containing(addr)
            .ok_or(DebugError::InvalidAddress { address: addr })?;
        let off = (addr - region.base) as usize * 2;
        if off + 16 > region.data.len() {
            return Err(DebugError::InvalidAddress { address: addr });
        }
        let bytes = hex::decode(&region.data[off..off + 16]).map_err(|e| {
            DebugError::CorruptArtifact {
                reason: format!("bad region data hex at {addr:#x}: {e}"),
            }
        })?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Lets the stack unwinder run against a dump exactly as it does live.
pub struct DumpMemory<'a>(pub &'a StoredDump);

impl MemorySource for DumpMemory<'_> {
    fn read_u64(&mut self, address: u64) -> Result<u64> {
        self.0.read_u64(address)
    }
}
