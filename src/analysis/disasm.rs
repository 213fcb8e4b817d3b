//! Disassembly engine
//!
//! Pure, table-driven decoder for the engine's reference ISA. The opcode
//! table is plain data, so swapping in another architecture means swapping
//! the table, not the engine. Decoding never touches the target: callers
//! hand in bytes they already read.

use std::fmt::Write as _;

use thiserror::Error;

/// Software breakpoint opcode. One byte so a trap can replace the first
/// byte of any instruction.
pub const TRAP_OPCODE: u8 = 0xCC;

/// Longest encoding in the table; fetch windows use this.
pub const MAX_INSN_LEN: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisasmError {
    #[error("invalid opcode {opcode:#04x} at {address:#x}")]
    InvalidOpcode { opcode: u8, address: u64 },

    #[error("truncated instruction at {address:#x}: need {need} bytes, have {have}")]
    Truncated {
        address: u64,
        need: usize,
        have: usize,
    },

    #[error("empty input at {address:#x}")]
    Empty { address: u64 },
}

/// Decoded operation, with operands resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Nop,
    /// r <- imm
    MovImm { dst: u8, imm: u64 },
    /// rd <- rs
    Mov { dst: u8, src: u8 },
    /// rd <- rd + rs
    Add { dst: u8, src: u8 },
    /// rd <- rd - rs
    Sub { dst: u8, src: u8 },
    /// r <- [addr] (8 bytes)
    Load { dst: u8, addr: u64 },
    /// [addr] <- r (8 bytes)
    Store { addr: u64, src: u8 },
    /// push return address; pc <- target
    Call { target: u64 },
    Ret,
    Jmp { target: u64 },
    /// push fp; fp <- sp
    Enter,
    /// sp <- fp; pop fp
    Leave,
    /// if r != 0 then pc <- target
    Bnz { cond: u8, target: u64 },
    /// exit with code r0
    Halt,
    /// software breakpoint
    Trap,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub op: Op,
    pub bytes: Vec<u8>,
}

/// One row of the architecture table: opcode, mnemonic, total encoded
/// length, and the operand decoder.
struct Encoding {
    opcode: u8,
    mnemonic: &'static str,
    length: usize,
    decode: fn(&[u8]) -> Op,
}

fn imm64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_le_bytes(buf)
}

/// The reference ISA. Pluggable data: the decoder below consults only this.
static ISA_TABLE: &[Encoding] = &[
    Encoding {
        opcode: 0x01,
        mnemonic: "nop",
        length: 1,
        decode: |_| Op::Nop,
    },
    Encoding {
        opcode: 0x10,
        mnemonic: "movi",
        length: 10,
        decode: |b| Op::MovImm {
            dst: b[1],
            imm: imm64(&b[2..]),
        },
    },
    Encoding {
        opcode: 0x11,
        mnemonic: "mov",
        length: 3,
        decode: |b| Op::Mov { dst: b[1], src: b[2] },
    },
    Encoding {
        opcode: 0x12,
        mnemonic: "add",
        length: 3,
        decode: |b| Op::Add { dst: b[1], src: b[2] },
    },
    Encoding {
        opcode: 0x13,
        mnemonic: "sub",
        length: 3,
        decode: |b| Op::Sub { dst: b[1], src: b[2] },
    },
    Encoding {
        opcode: 0x20,
        mnemonic: "load",
        length: 10,
        decode: |b| Op::Load {
            dst: b[1],
            addr: imm64(&b[2..]),
        },
    },
    Encoding {
        opcode: 0x21,
        mnemonic: "store",
        length: 10,
        decode: |b| Op::Store {
            addr: imm64(&b[1..]),
            src: b[9],
        },
    },
    Encoding {
        opcode: 0x30,
        mnemonic: "call",
        length: 9,
        decode: |b| Op::Call {
            target: imm64(&b[1..]),
        },
    },
    Encoding {
        opcode: 0x31,
        mnemonic: "ret",
        length: 1,
        decode: |_| Op::Ret,
    },
    Encoding {
        opcode: 0x32,
        mnemonic: "jmp",
        length: 9,
        decode: |b| Op::Jmp {
            target: imm64(&b[1..]),
        },
    },
    Encoding {
        opcode: 0x33,
        mnemonic: "enter",
        length: 1,
        decode: |_| Op::Enter,
    },
    Encoding {
        opcode: 0x34,
        mnemonic: "leave",
        length: 1,
        decode: |_| Op::Leave,
    },
    Encoding {
        opcode: 0x35,
        mnemonic: "bnz",
        length: 10,
        decode: |b| Op::Bnz {
            cond: b[1],
            target: imm64(&b[2..]),
        },
    },
    Encoding {
        opcode: 0x40,
        mnemonic: "halt",
        length: 1,
        decode: |_| Op::Halt,
    },
    Encoding {
        opcode: TRAP_OPCODE,
        mnemonic: "trap",
        length: 1,
        decode: |_| Op::Trap,
    },
];

fn table_row(opcode: u8) -> Option<&'static Encoding> {
    ISA_TABLE.iter().find(|e| e.opcode == opcode)
}

/// Register name for an operand index.
pub fn reg_name(idx: u8) -> &'static str {
    const NAMES: [&str; 8] = ["r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7"];
    NAMES.get(idx as usize).copied().unwrap_or("r?")
}

/// Register index for a canonical name.
pub fn reg_index(name: &str) -> Option<u8> {
    let idx = name.strip_prefix('r')?.parse::<u8>().ok()?;
    (idx < 8).then_some(idx)
}

impl Instruction {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the instruction that follows in straight-line execution.
    pub fn next_address(&self) -> u64 {
        self.address + self.bytes.len() as u64
    }

    pub fn mnemonic(&self) -> &'static str {
        table_row(self.bytes[0]).map(|e| e.mnemonic).unwrap_or("???")
    }

    pub fn is_flow_control(&self) -> bool {
        matches!(
            self.op,
            Op::Call { .. } | Op::Ret | Op::Jmp { .. } | Op::Bnz { .. } | Op::Halt
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(self.op, Op::Call { .. })
    }

    pub fn operand_str(&self) -> String {
        match self.op {
            Op::Nop | Op::Ret | Op::Enter | Op::Leave | Op::Halt | Op::Trap => String::new(),
            Op::MovImm { dst, imm } => format!("{}, {:#x}", reg_name(dst), imm),
            Op::Mov { dst, src } | Op::Add { dst, src } | Op::Sub { dst, src } => {
                format!("{}, {}", reg_name(dst), reg_name(src))
            }
            Op::Load { dst, addr } => format!("{}, [{:#x}]", reg_name(dst), addr),
            Op::Store { addr, src } => format!("[{:#x}], {}", addr, reg_name(src)),
            Op::Call { target } | Op::Jmp { target } => format!("{target:#x}"),
            Op::Bnz { cond, target } => format!("{}, {:#x}", reg_name(cond), target),
        }
    }

    /// One listing line: address, raw bytes, mnemonic, operands.
    pub fn format_full(&self) -> String {
        let mut bytes_str = String::new();
        for b in &self.bytes {
            write!(bytes_str, "{b:02x} ").unwrap();
        }
        format!(
            "{:#012x} | {:<30} | {:<6} {}",
            self.address,
            bytes_str.trim_end(),
            self.mnemonic(),
            self.operand_str()
        )
    }
}

/// Decode one instruction from `bytes`, assumed to start at `address`.
pub fn decode(bytes: &[u8], address: u64) -> Result<Instruction, DisasmError> {
    let opcode = *bytes.first().ok_or(DisasmError::Empty { address })?;
    let row = table_row(opcode).ok_or(DisasmError::InvalidOpcode { opcode, address })?;
    if bytes.len() < row.length {
        return Err(DisasmError::Truncated {
            address,
            need: row.length,
            have: bytes.len(),
        });
    }
    let encoded = &bytes[..row.length];
    Ok(Instruction {
        address,
        op: (row.decode)(encoded),
        bytes: encoded.to_vec(),
    })
}

/// Decode up to `count` consecutive instructions. Pure function of the
/// bytes; stops early at the first undecodable byte and returns what it has.
pub fn disassemble(bytes: &[u8], address: u64, count: usize) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while out.len() < count && offset < bytes.len() {
        match decode(&bytes[offset..], address + offset as u64) {
            Ok(insn) => {
                offset += insn.len();
                out.push(insn);
            }
            Err(_) => break,
        }
    }
    out
}

/// Tiny assembler used by tests and the simulator's program builder.
pub fn encode(op: Op) -> Vec<u8> {
    match op {
        Op::Nop => vec![0x01],
        Op::MovImm { dst, imm } => {
            let mut v = vec![0x10, dst];
            v.extend_from_slice(&imm.to_le_bytes());
            v
        }
        Op::Mov { dst, src } => vec![0x11, dst, src],
        Op::Add { dst, src } => vec![0x12, dst, src],
        Op::Sub { dst, src } => vec![0x13, dst, src],
        Op::Load { dst, addr } => {
            let mut v = vec![0x20, dst];
            v.extend_from_slice(&addr.to_le_bytes());
            v
        }
        Op::Store { addr, src } => {
            let mut v = vec![0x21];
            v.extend_from_slice(&addr.to_le_bytes());
            v.push(src);
            v
        }
        Op::Call { target } => {
            let mut v = vec![0x30];
            v.extend_from_slice(&target.to_le_bytes());
            v
        }
        Op::Ret => vec![0x31],
        Op::Jmp { target } => {
            let mut v = vec![0x32];
            v.extend_from_slice(&target.to_le_bytes());
            v
        }
        Op::Enter => vec![0x33],
        Op::Leave => vec![0x34],
        Op::Bnz { cond, target } => {
            let mut v = vec![0x35, cond];
            v.extend_from_slice(&target.to_le_bytes());
            v
        }
        Op::Halt => vec![0x40],
        Op::Trap => vec![TRAP_OPCODE],
    }
}

/// Assemble a sequence of operations into flat bytes.
pub fn assemble(ops: &[Op]) -> Vec<u8> {
    let mut out = Vec::new();
    for &op in ops {
        out.extend(encode(op));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let ops = [
            Op::Nop,
            Op::MovImm { dst: 3, imm: 0xdead_beef },
            Op::Add { dst: 0, src: 1 },
            Op::Load { dst: 2, addr: 0x5000 },
            Op::Store { addr: 0x5008, src: 2 },
            Op::Call { target: 0x1040 },
            Op::Bnz { cond: 1, target: 0x1000 },
            Op::Halt,
        ];
        let bytes = assemble(&ops);
        let insns = disassemble(&bytes, 0x1000, ops.len());
        assert_eq!(insns.len(), ops.len());
        for (insn, op) in insns.iter().zip(ops.iter()) {
            assert_eq!(insn.op, *op);
        }
        // addresses are consecutive by encoded length
        assert_eq!(insns[1].address, 0x1001);
        assert_eq!(insns[2].address, 0x100b);
    }

    #[test]
    fn invalid_opcode_is_an_error() {
        let err = decode(&[0xff], 0x2000).unwrap_err();
        assert_eq!(
            err,
            DisasmError::InvalidOpcode {
                opcode: 0xff,
                address: 0x2000
            }
        );
    }

    #[test]
    fn truncated_instruction_is_an_error() {
        // movi needs 10 bytes
        let err = decode(&[0x10, 0x00, 0x01], 0).unwrap_err();
        assert!(matches!(err, DisasmError::Truncated { need: 10, .. }));
    }

    #[test]
    fn disassemble_stops_at_undecodable_bytes() {
        let mut bytes = encode(Op::Nop);
        bytes.push(0xfe);
        let insns = disassemble(&bytes, 0, 10);
        assert_eq!(insns.len(), 1);
    }

    #[test]
    fn listing_format_is_stable() {
        let insn = decode(&encode(Op::MovImm { dst: 0, imm: 42 }), 0x1000).unwrap();
        let line = insn.format_full();
        assert!(line.contains("movi"));
        assert!(line.contains("r0, 0x2a"));
    }

    #[test]
    fn register_names_round_trip() {
        for i in 0..8u8 {
            assert_eq!(reg_index(reg_name(i)), Some(i));
        }
        assert_eq!(reg_index("r8"), None);
        assert_eq!(reg_index("pc"), None);
    }
}
