//! Structural path exploration
//!
//! Static walk of decoded code that forks at every conditional branch and
//! records the constraint each side assumes. No values are solved for; the
//! output is the set of structurally reachable paths and the branch
//! decisions that select each one, which is enough to enumerate the inputs
//! a fuzzer or a condition-synthesis pass would need to distinguish.
//!
//! Exploration is bounded on both axes. Hitting a bound never fails: the
//! paths found so far come back with the `truncated` flag set.

use std::collections::VecDeque;
use std::fmt;

use crate::analysis::disasm::{self, reg_name, Op};
use crate::core::error::Result;
use crate::core::session::Session;

/// Branch decision assumed along a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchConstraint {
    /// Address of the branch instruction.
    pub pc: u64,
    pub register: String,
    /// True when the path assumes the branch was taken.
    pub taken: bool,
}

impl fmt::Display for BranchConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.taken { "!=" } else { "==" };
        write!(f, "{} {op} 0 at {:#x}", self.register, self.pc)
    }
}

/// How a path ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEnd {
    /// Reached a halt instruction.
    Halt,
    /// Returned past the entry frame.
    Ret,
    /// Ran into a trap opcode.
    Trap,
    /// Left the decodable code range.
    Undecodable,
    /// Hit the per-path instruction budget.
    StepBudget,
}

/// One explored path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSummary {
    pub constraints: Vec<BranchConstraint>,
    pub end: PathEnd,
    pub end_pc: u64,
    pub steps: usize,
}

/// Exploration bounds.
#[derive(Debug, Clone, Copy)]
pub struct ExploreLimits {
    pub max_paths: usize,
    pub max_steps: usize,
}

impl Default for ExploreLimits {
    fn default() -> Self {
        Self {
            max_paths: 64,
            max_steps: 256,
        }
    }
}

/// Paths found, with `truncated` set when a bound cut the search short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exploration {
    pub paths: Vec<PathSummary>,
    pub truncated: bool,
}

struct PendingPath {
    pc: u64,
    constraints: Vec<BranchConstraint>,
    /// Return addresses of calls followed into, innermost last.
    call_stack: Vec<u64>,
    steps: usize,
}

/// Explore all structural paths through `code` starting at `entry`.
/// `code` is the flat byte image of the region based at `base`.
/// Deterministic: the worklist is processed breadth-first and the
/// fall-through side of each branch is enqueued before the taken side.
pub fn explore(code: &[u8], base: u64, entry: u64, limits: ExploreLimits) -> Exploration {
    let mut paths = Vec::new();
    let mut truncated = false;
    let mut work = VecDeque::new();
    work.push_back(PendingPath {
        pc: entry,
        constraints: Vec::new(),
        call_stack: Vec::new(),
        steps: 0,
    });

    while let Some(mut path) = work.pop_front() {
        if paths.len() >= limits.max_paths {
            truncated = true;
            break;
        }
        let end = loop {
            if path.steps >= limits.max_steps {
                truncated = true;
                break PathEnd::StepBudget;
            }
            let Some(offset) = path.pc.checked_sub(base).map(|o| o as usize) else {
                break PathEnd::Undecodable;
            };
            if offset >= code.len() {
                break PathEnd::Undecodable;
            }
            if code[offset] == disasm::TRAP_OPCODE {
                break PathEnd::Trap;
            }
            let insn = match disasm::decode(&code[offset..], path.pc) {
                Ok(i) => i,
                Err(_) => break PathEnd::Undecodable,
            };
            path.steps += 1;
            match insn.op {
                Op::Halt => break PathEnd::Halt,
                Op::Ret => match path.call_stack.pop() {
                    Some(ret) => path.pc = ret,
                    None => break PathEnd::Ret,
                },
                Op::Call { target } => {
                    path.call_stack.push(insn.next_address());
                    path.pc = target;
                }
                Op::Jmp { target } => path.pc = target,
                Op::Bnz { cond, target } => {
                    let mut taken = PendingPath {
                        pc: target,
                        constraints: path.constraints.clone(),
                        call_stack: path.call_stack.clone(),
                        steps: path.steps,
                    };
                    taken.constraints.push(BranchConstraint {
                        pc: insn.address,
                        register: reg_name(cond).to_string(),
                        taken: true,
                    });
                    work.push_back(taken);
                    path.constraints.push(BranchConstraint {
                        pc: insn.address,
                        register: reg_name(cond).to_string(),
                        taken: false,
                    });
                    path.pc = insn.next_address();
                }
                _ => path.pc = insn.next_address(),
            }
        };
        paths.push(PathSummary {
            constraints: path.constraints,
            end,
            end_pc: path.pc,
            steps: path.steps,
        });
    }

    if !work.is_empty() {
        truncated = true;
    }
    log::debug!(
        "path exploration from {entry:#x}: {} path(s), truncated={truncated}",
        paths.len()
    );
    Exploration { paths, truncated }
}

impl Session {
    /// Explore structural paths starting at `entry`, reading the code image
    /// from the region that contains it. Installed software breakpoints are
    /// patched back to the original bytes in the local copy first, so
    /// exploration sees the real program.
    pub fn explore_paths(&mut self, entry: u64, limits: ExploreLimits) -> Result<Exploration> {
        self.ensure_attached("explore_paths")?;
        self.ensure_stopped("explore_paths")?;
        let region = self
            .memory_map
            .region_at(entry)
            .ok_or(crate::core::error::DebugError::InvalidAddress { address: entry })?
            .clone();
        let mut code = self.read_memory(region.base, region.len as usize)?;
        for bp in self.traps.breakpoints() {
            if bp.enabled && region.contains(bp.address) {
                if let Some(orig) = bp.saved_byte {
                    code[(bp.address - region.base) as usize] = orig;
                }
            }
        }
        Ok(explore(&code, region.base, entry, limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breakpoint::BreakpointKind;
    use crate::debug::sim::{SimTarget, CODE_BASE};

    #[test]
    fn straight_line_is_one_path() {
        let code = disasm::assemble(&[Op::Nop, Op::MovImm { dst: 0, imm: 1 }, Op::Halt]);
        let ex = explore(&code, CODE_BASE, CODE_BASE, ExploreLimits::default());
        assert_eq!(ex.paths.len(), 1);
        assert_eq!(ex.paths[0].end, PathEnd::Halt);
        assert!(ex.paths[0].constraints.is_empty());
        assert!(!ex.truncated);
    }

    #[test]
    fn branch_forks_into_two_constrained_paths() {
        // bnz r1, skip; movi r0, 1; skip: halt
        let skip = CODE_BASE + 20;
        let code = disasm::assemble(&[
            Op::Bnz {
                cond: 1,
                target: skip,
            },
            Op::MovImm { dst: 0, imm: 1 },
            Op::Halt,
        ]);
        let ex = explore(&code, CODE_BASE, CODE_BASE, ExploreLimits::default());
        assert_eq!(ex.paths.len(), 2);
        // fall-through path comes first and assumes r1 == 0
        assert_eq!(ex.paths[0].constraints.len(), 1);
        assert!(!ex.paths[0].constraints[0].taken);
        assert_eq!(ex.paths[0].constraints[0].register, "r1");
        assert!(ex.paths[1].constraints[0].taken);
        assert!(ex.paths.iter().all(|p| p.end == PathEnd::Halt));
    }

    #[test]
    fn calls_are_followed_and_return() {
        // call f; halt; f: nop; ret
        let f = CODE_BASE + 10;
        let code = disasm::assemble(&[Op::Call { target: f }, Op::Halt, Op::Nop, Op::Ret]);
        let ex = explore(&code, CODE_BASE, CODE_BASE, ExploreLimits::default());
        assert_eq!(ex.paths.len(), 1);
        assert_eq!(ex.paths[0].end, PathEnd::Halt);
    }

    #[test]
    fn infinite_loop_exhausts_the_step_budget() {
        let code = disasm::assemble(&[Op::Jmp { target: CODE_BASE }]);
        let limits = ExploreLimits {
            max_paths: 4,
            max_steps: 32,
        };
        let ex = explore(&code, CODE_BASE, CODE_BASE, limits);
        assert_eq!(ex.paths.len(), 1);
        assert_eq!(ex.paths[0].end, PathEnd::StepBudget);
        assert!(ex.truncated);
    }

    #[test]
    fn path_budget_truncates_wide_branch_trees() {
        // four chained branches produce up to sixteen leaves
        let mut ops = Vec::new();
        for i in 0..4u8 {
            ops.push(Op::Bnz {
                cond: i,
                target: CODE_BASE + 100,
            });
        }
        ops.push(Op::Halt);
        let code = disasm::assemble(&ops);
        let limits = ExploreLimits {
            max_paths: 3,
            max_steps: 64,
        };
        let ex = explore(&code, CODE_BASE, CODE_BASE, limits);
        assert_eq!(ex.paths.len(), 3);
        assert!(ex.truncated);
    }

    #[test]
    fn live_exploration_sees_through_breakpoints() {
        let skip = CODE_BASE + 20;
        let mut s = crate::core::session::Session::attach(Box::new(SimTarget::with_program(&[
            Op::Bnz {
                cond: 1,
                target: skip,
            },
            Op::MovImm { dst: 0, imm: 1 },
            Op::Halt,
        ])))
        .unwrap();
        s.set_breakpoint(CODE_BASE + 10, BreakpointKind::Software, None)
            .unwrap();
        let ex = s
            .explore_paths(CODE_BASE, ExploreLimits::default())
            .unwrap();
        // the patched trap byte does not end the fall-through path early
        assert_eq!(ex.paths.len(), 2);
        assert!(ex.paths.iter().all(|p| p.end == PathEnd::Halt));
    }
}
