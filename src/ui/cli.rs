//! CLI - reedline-based REPL interface
//!
//! Interactive front end over one debugging session. Every command is
//! parsed into a [`ParsedCommand`] first, so the grammar is testable
//! without a terminal; execution reports engine errors with their result
//! codes and keeps the REPL alive unless the error killed the session.

use std::borrow::Cow;
use std::path::PathBuf;

use colored::Colorize;
use reedline::{
    Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal,
};

use crate::analysis::disasm;
use crate::core::breakpoint::{BreakpointKind, Condition};
use crate::core::error::{DebugError, Result};
use crate::core::session::{Session, SessionState, StopEvent, StopReason};
use crate::crash::dump::StoredDump;
use crate::debug::sim::SimTarget;
use crate::debug::WatchAccess;
use crate::instrument::symbolic::ExploreLimits;
use crate::instrument::HookVerdict;

/// Prompt showing session status and the current stop address.
pub struct RiftPrompt {
    current_address: u64,
    attached: bool,
}

impl RiftPrompt {
    pub fn new() -> Self {
        Self {
            current_address: 0,
            attached: false,
        }
    }

    fn update(&mut self, session: Option<&Session>) {
        self.attached = matches!(session.map(Session::state), Some(SessionState::Attached));
        self.current_address = session
            .and_then(|s| s.last_stop())
            .map(|ev| ev.pc)
            .unwrap_or(0);
    }
}

impl Default for RiftPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompt for RiftPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        let status = if self.attached { "dbg" } else { "---" };
        Cow::Owned(format!("[{}:{:#x}]", status, self.current_address))
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "(failed) ",
        };
        Cow::Owned(format!("(search: {}{}) ", prefix, history_search.term))
    }
}

/// Command parsing result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    /// Attach to a live process: attach <pid>
    Attach(u32),
    /// Load the built-in demo target: demo
    Demo,
    /// Detach from the target: detach
    Detach,
    /// Set breakpoint: b <addr> [--hw] [--once] [--if <cond>]
    BreakpointSet {
        addr: u64,
        hardware: bool,
        one_shot: bool,
        condition: Option<String>,
    },
    /// Set watchpoint: watch <addr> <len> [r|w|rw]
    WatchpointSet {
        addr: u64,
        len: u64,
        access: WatchAccess,
    },
    /// Remove a trap by id: clear <id>
    Clear(u32),
    /// Disable / enable a breakpoint: disable <id>, enable <id>
    Disable(u32),
    Enable(u32),
    /// List traps: bl
    ListTraps,
    /// Continue execution: c
    Continue,
    /// Step one instruction: s
    StepInto,
    /// Step over calls: n, step --over
    StepOver,
    /// Raise the interrupt flag: interrupt
    Interrupt,
    /// Show registers: regs
    Registers,
    /// Show memory map: dm
    MemoryMap,
    /// Hex-read memory: x <addr> <len>
    ReadMemory { addr: u64, len: usize },
    /// Disassemble: pd [n] [@ <addr>], disas <addr> [count]
    Disassemble { addr: Option<u64>, count: usize },
    /// Backtrace: bt
    Backtrace,
    /// Record an execution trace: trace <budget>
    Trace(usize),
    /// Install a hook: hook <addr> [log|resume]
    Hook { addr: u64, resume: bool },
    /// List hooks: hooks
    ListHooks,
    /// Enumerate structural paths: paths <addr>
    Explore(u64),
    /// Triage the last fault: crash
    AnalyzeCrash,
    /// Save the last fault as a dump: dump <path>
    SaveDump(PathBuf),
    /// Triage a stored dump: crash <path>, analyze-crash <path>
    AnalyzeDump(PathBuf),
    /// Help: ? or help
    Help,
    /// Quit: q or exit
    Quit,
    /// Unknown command
    Unknown(String),
}

/// Parse a command string into a structured command
pub fn parse_command(input: &str) -> ParsedCommand {
    let input = input.trim();
    let parts: Vec<&str> = input.split_whitespace().collect();
    let cmd = parts.first().copied().unwrap_or("");
    let args = &parts[1..];

    let unknown = || ParsedCommand::Unknown(input.to_string());

    match cmd {
        "attach" => match args.first().and_then(|s| s.parse().ok()) {
            Some(pid) => ParsedCommand::Attach(pid),
            None => unknown(),
        },
        "demo" => ParsedCommand::Demo,
        "detach" => ParsedCommand::Detach,

        "b" | "break" => {
            let Some(addr) = args.first().and_then(|s| parse_address(s).ok()) else {
                return unknown();
            };
            let mut hardware = false;
            let mut one_shot = false;
            let mut condition = None;
            let mut rest = args[1..].iter();
            while let Some(flag) = rest.next() {
                match *flag {
                    "--hw" => hardware = true,
                    "--once" => one_shot = true,
                    "--if" => {
                        let expr: Vec<&str> = rest.by_ref().copied().collect();
                        if expr.is_empty() {
                            return unknown();
                        }
                        condition = Some(expr.join(" "));
                    }
                    _ => return unknown(),
                }
            }
            ParsedCommand::BreakpointSet {
                addr,
                hardware,
                one_shot,
                condition,
            }
        }
        "watch" => {
            let addr = args.first().and_then(|s| parse_address(s).ok());
            let len = args.get(1).and_then(|s| parse_address(s).ok());
            let access = match args.get(2) {
                Some(s) => match s.parse() {
                    Ok(a) => a,
                    Err(_) => return unknown(),
                },
                None => WatchAccess::Write,
            };
            match (addr, len) {
                (Some(addr), Some(len)) => ParsedCommand::WatchpointSet { addr, len, access },
                _ => unknown(),
            }
        }
        "clear" => match args.first().and_then(|s| s.parse().ok()) {
            Some(id) => ParsedCommand::Clear(id),
            None => unknown(),
        },
        "disable" => match args.first().and_then(|s| s.parse().ok()) {
            Some(id) => ParsedCommand::Disable(id),
            None => unknown(),
        },
        "enable" => match args.first().and_then(|s| s.parse().ok()) {
            Some(id) => ParsedCommand::Enable(id),
            None => unknown(),
        },
        "bl" | "traps" => ParsedCommand::ListTraps,

        "c" | "continue" | "dc" => ParsedCommand::Continue,
        "s" | "step" | "ds" => match args.first().copied() {
            None => ParsedCommand::StepInto,
            Some("--over") => ParsedCommand::StepOver,
            Some(_) => unknown(),
        },
        "n" | "next" | "dso" => ParsedCommand::StepOver,
        "interrupt" => ParsedCommand::Interrupt,

        "regs" | "dr" => ParsedCommand::Registers,
        "dm" => ParsedCommand::MemoryMap,
        "x" => {
            let addr = args.first().and_then(|s| parse_address(s).ok());
            let len = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(64);
            match addr {
                Some(addr) => ParsedCommand::ReadMemory { addr, len },
                None => unknown(),
            }
        }
        "pd" => {
            let mut count = 10;
            let mut addr = None;
            let mut it = args.iter().peekable();
            if let Some(n) = it.peek().and_then(|s| s.parse::<usize>().ok()) {
                count = n;
                it.next();
            }
            if it.peek() == Some(&&"@") {
                it.next();
                match it.next().and_then(|s| parse_address(s).ok()) {
                    Some(a) => addr = Some(a),
                    None => return unknown(),
                }
            }
            ParsedCommand::Disassemble { addr, count }
        }
        // positional form: disas <addr> [count]
        "disas" => match args.first() {
            None => ParsedCommand::Disassemble {
                addr: None,
                count: 10,
            },
            Some(a) => {
                let Ok(addr) = parse_address(a) else {
                    return unknown();
                };
                let count = match args.get(1) {
                    Some(n) => match n.parse() {
                        Ok(c) => c,
                        Err(_) => return unknown(),
                    },
                    None => 10,
                };
                ParsedCommand::Disassemble {
                    addr: Some(addr),
                    count,
                }
            }
        },
        "bt" | "backtrace" => ParsedCommand::Backtrace,

        "trace" => {
            let budget = args.first().and_then(|s| s.parse().ok()).unwrap_or(100);
            ParsedCommand::Trace(budget)
        }
        "hook" => {
            let Some(addr) = args.first().and_then(|s| parse_address(s).ok()) else {
                return unknown();
            };
            match args.get(1).copied() {
                None | Some("log") => ParsedCommand::Hook {
                    addr,
                    resume: false,
                },
                Some("resume") => ParsedCommand::Hook { addr, resume: true },
                Some(_) => unknown(),
            }
        }
        "hooks" => ParsedCommand::ListHooks,
        "paths" => match args.first().and_then(|s| parse_address(s).ok()) {
            Some(addr) => ParsedCommand::Explore(addr),
            None => unknown(),
        },

        "crash" | "analyze-crash" => match args.first() {
            Some(path) => ParsedCommand::AnalyzeDump(PathBuf::from(path)),
            None => ParsedCommand::AnalyzeCrash,
        },
        "dump" => match args.first() {
            Some(path) => ParsedCommand::SaveDump(PathBuf::from(path)),
            None => unknown(),
        },

        "?" | "help" => ParsedCommand::Help,
        "q" | "quit" | "exit" => ParsedCommand::Quit,

        _ => unknown(),
    }
}

/// Parse an address string (supports 0x prefix and decimal)
fn parse_address(s: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

/// Print the help message
fn print_help() {
    println!("{}", "Rift Commands".bold().cyan());
    println!("{}", "═".repeat(50).cyan());

    println!("\n{}", "Session:".bold().yellow());
    println!("  {}        Attach to a process", "attach <pid>".green());
    println!("  {}                Load the built-in demo target", "demo".green());
    println!("  {}              Detach and release the target", "detach".green());

    println!("\n{}", "Traps:".bold().yellow());
    println!(
        "  {}  Set breakpoint",
        "b <addr> [--hw] [--once] [--if <cond>]".green()
    );
    println!("  {}  Set watchpoint", "watch <addr> <len> [r|w|rw]".green());
    println!("  {}          Remove a trap by id", "clear <id>".green());
    println!("  {}   Toggle a breakpoint", "disable/enable <id>".green());
    println!("  {}                  List traps", "bl".green());

    println!("\n{}", "Execution:".bold().yellow());
    println!("  {}                   Continue", "c".green());
    println!("  {}                   Step one instruction", "s".green());
    println!("  {}       Step over calls", "n / step --over".green());
    println!("  {}           Cancel the next blocking run", "interrupt".green());

    println!("\n{}", "Inspection:".bold().yellow());
    println!("  {}                Show registers", "regs".green());
    println!("  {}                  Show memory map", "dm".green());
    println!("  {}        Hex-dump memory", "x <addr> [len]".green());
    println!("  {}   Disassemble", "pd [n] [@ <addr>]".green());
    println!("  {}  Disassemble at address", "disas <addr> [count]".green());
    println!("  {}                  Backtrace", "bt".green());

    println!("\n{}", "Instrumentation:".bold().yellow());
    println!("  {}      Record an execution trace", "trace [budget]".green());
    println!(
        "  {}  Hook an address",
        "hook <addr> [log|resume]".green()
    );
    println!("  {}               List hooks", "hooks".green());
    println!("  {}        Enumerate structural paths", "paths <addr>".green());

    println!("\n{}", "Crash analysis:".bold().yellow());
    println!("  {}               Triage the last fault", "crash".green());
    println!("  {}        Triage a stored dump", "crash <path>".green());
    println!("  {}  Triage a stored dump", "analyze-crash <path>".green());
    println!("  {}         Save the last fault as a dump", "dump <path>".green());

    println!("\n{}", "Other:".bold().yellow());
    println!("  {}                   Show this help", "?".green());
    println!("  {}                   Quit", "q".green());
}

/// Whether the REPL keeps running after a command.
#[derive(Debug)]
enum Flow {
    Continue,
    Quit,
}

/// REPL state: at most one session at a time.
struct Repl {
    session: Option<Session>,
}

impl Repl {
    fn new() -> Self {
        Self { session: None }
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(DebugError::StateViolation {
            operation: "command",
            state: "no session".into(),
        })
    }

    fn report_stop(&self, ev: &StopEvent) {
        match ev.reason {
            StopReason::Exit(code) => {
                println!("[*] target exited with code {code}");
            }
            reason => {
                println!("[*] stopped: {} at {:#x}", reason.to_string().yellow(), ev.pc);
            }
        }
    }

    /// Register changes caused by a step, skipped once the target is gone.
    fn report_deltas(
        &mut self,
        ev: &StopEvent,
        before: &crate::core::registers::RegisterSet,
    ) -> Result<()> {
        if matches!(ev.reason, StopReason::Exit(_)) {
            return Ok(());
        }
        let after = self.session()?.registers_current()?;
        for d in after.diff(before) {
            println!("    {:<8} {:#x} -> {:#x}", d.name, d.old, d.new);
        }
        Ok(())
    }

    fn execute(&mut self, cmd: ParsedCommand) -> Result<Flow> {
        match cmd {
            ParsedCommand::Attach(pid) => self.attach_pid(pid)?,
            ParsedCommand::Demo => {
                let mut session = Session::attach(Box::new(demo_target()))?;
                session.define_symbol("main", demo::MAIN_LOW, demo::MAIN_HIGH);
                session.define_symbol("f", demo::F_LOW, demo::F_HIGH);
                println!(
                    "[*] demo target loaded, entry at {:#x}",
                    demo::MAIN_LOW
                );
                self.session = Some(session);
            }
            ParsedCommand::Detach => {
                let res = self.session()?.detach();
                self.session = None;
                res?;
                println!("[*] detached");
            }
            ParsedCommand::BreakpointSet {
                addr,
                hardware,
                one_shot,
                condition,
            } => {
                let condition = match condition.map(|c| c.parse::<Condition>()).transpose() {
                    Ok(cond) => cond,
                    Err(reason) => {
                        println!("{} {}", "[!]".red(), reason);
                        return Ok(Flow::Continue);
                    }
                };
                let kind = if hardware {
                    BreakpointKind::Hardware
                } else {
                    BreakpointKind::Software
                };
                let session = self.session()?;
                let id = if one_shot {
                    session.set_one_shot_breakpoint(addr, kind)?
                } else {
                    session.set_breakpoint(addr, kind, condition)?
                };
                println!("[*] breakpoint {id} set at {addr:#x} ({kind})");
            }
            ParsedCommand::WatchpointSet { addr, len, access } => {
                let id = self.session()?.set_watchpoint(addr, len, access)?;
                println!("[*] watchpoint {id} set at {addr:#x}+{len} ({access})");
            }
            ParsedCommand::Clear(id) => {
                self.session()?.clear_trap(id)?;
                println!("[*] trap {id} removed");
            }
            ParsedCommand::Disable(id) => {
                self.session()?.disable_breakpoint(id)?;
                println!("[*] breakpoint {id} disabled");
            }
            ParsedCommand::Enable(id) => {
                self.session()?.enable_breakpoint(id)?;
                println!("[*] breakpoint {id} enabled");
            }
            ParsedCommand::ListTraps => {
                let session = self.session()?;
                for bp in session.traps().user_breakpoints() {
                    let state = if bp.enabled { "enabled" } else { "disabled" };
                    let cond = bp
                        .condition
                        .as_ref()
                        .map(|c| format!(" if {c}"))
                        .unwrap_or_default();
                    println!(
                        "  bp {:>3}  {:#012x}  {}  {}  hits={}{}",
                        bp.id, bp.address, bp.kind, state, bp.hit_count, cond
                    );
                }
                for wp in session.traps().watchpoints() {
                    println!(
                        "  wp {:>3}  {:#012x}+{}  {}  hits={}",
                        wp.id, wp.address, wp.len, wp.access, wp.hit_count
                    );
                }
            }
            ParsedCommand::Continue => {
                let ev = self.session()?.resume()?;
                self.report_stop(&ev);
            }
            ParsedCommand::StepInto => {
                let session = self.session()?;
                let before = session.registers_current()?;
                let ev = session.step_into()?;
                self.report_stop(&ev);
                self.report_deltas(&ev, &before)?;
            }
            ParsedCommand::StepOver => {
                let session = self.session()?;
                let before = session.registers_current()?;
                let ev = session.step_over()?;
                self.report_stop(&ev);
                self.report_deltas(&ev, &before)?;
            }
            ParsedCommand::Interrupt => {
                self.session()?.interrupt();
                println!("[*] interrupt requested");
            }
            ParsedCommand::Registers => {
                let regs = self.session()?.registers_current()?;
                for (name, value) in regs.iter() {
                    println!("    {:<8} = {:#018x}", name, value);
                }
            }
            ParsedCommand::MemoryMap => {
                let session = self.session()?;
                session.refresh_memory_map()?;
                for region in session.memory_map().regions() {
                    println!(
                        "  {:#012x}-{:#012x}  {}  {}",
                        region.base,
                        region.end(),
                        region.protection,
                        region.name.as_deref().unwrap_or("")
                    );
                }
            }
            ParsedCommand::ReadMemory { addr, len } => {
                let bytes = self.session()?.read_memory(addr, len)?;
                for (i, chunk) in bytes.chunks(16).enumerate() {
                    println!(
                        "  {:#012x}  {}",
                        addr + (i * 16) as u64,
                        hex::encode(chunk)
                    );
                }
            }
            ParsedCommand::Disassemble { addr, count } => {
                let session = self.session()?;
                let start = match addr {
                    Some(a) => a,
                    None => session.registers_current()?.pc(),
                };
                let window = count * disasm::MAX_INSN_LEN;
                let bytes = session.read_memory(start, window).or_else(|_| {
                    // shrink to the containing region near its end
                    let region = session
                        .memory_map()
                        .region_at(start)
                        .ok_or(DebugError::InvalidAddress { address: start })?
                        .clone();
                    session.read_memory(start, (region.end() - start) as usize)
                })?;
                for insn in disasm::disassemble(&bytes, start, count) {
                    let line = insn.format_full();
                    if insn.is_flow_control() {
                        println!("  {}", line.yellow());
                    } else {
                        println!("  {line}");
                    }
                }
            }
            ParsedCommand::Backtrace => {
                let bt = self.session()?.backtrace(64)?;
                for frame in &bt.frames {
                    println!("  {frame}");
                }
                if bt.corrupt {
                    println!("  {}", "(frame chain broken)".red());
                }
                if bt.truncated {
                    println!("  (truncated)");
                }
            }
            ParsedCommand::Trace(budget) => {
                let log = self.session()?.trace(budget)?;
                for entry in &log.entries {
                    let mut effects = entry
                        .register_deltas
                        .iter()
                        .filter(|d| d.name != "pc")
                        .map(|d| format!("{}={:#x}", d.name, d.new))
                        .collect::<Vec<_>>()
                        .join(" ");
                    if let Some((addr, value)) = entry.memory_write {
                        if !effects.is_empty() {
                            effects.push(' ');
                        }
                        effects.push_str(&format!("[{addr:#x}]={value:#x}"));
                    }
                    println!(
                        "  [{:>4}] {:#012x}  {:<24} {}",
                        entry.index,
                        entry.pc,
                        format!("{:?}", entry.op),
                        effects.dimmed()
                    );
                }
                if log.truncated {
                    println!("  (budget exhausted)");
                }
            }
            ParsedCommand::Hook { addr, resume } => {
                let verdict = if resume {
                    HookVerdict::Resume
                } else {
                    HookVerdict::Stay
                };
                let id = self.session()?.install_hook(addr, move |ctx| {
                    println!(
                        "  {} hook at {:#x} (hit {})",
                        "[hook]".cyan(),
                        ctx.pc,
                        ctx.hit_count
                    );
                    verdict
                })?;
                println!("[*] hook {id} installed at {addr:#x}");
            }
            ParsedCommand::ListHooks => {
                for (id, addr, hits) in self.session()?.hooks() {
                    println!("  hook {:>3}  {:#012x}  hits={}", id, addr, hits);
                }
            }
            ParsedCommand::Explore(addr) => {
                let ex = self
                    .session()?
                    .explore_paths(addr, ExploreLimits::default())?;
                for (i, path) in ex.paths.iter().enumerate() {
                    let constraints: Vec<String> =
                        path.constraints.iter().map(|c| c.to_string()).collect();
                    println!(
                        "  path {:>2}: {:?} after {} step(s)  [{}]",
                        i,
                        path.end,
                        path.steps,
                        constraints.join(", ")
                    );
                }
                if ex.truncated {
                    println!("  (exploration truncated)");
                }
            }
            ParsedCommand::AnalyzeCrash => {
                let report = self.session()?.analyze_crash()?;
                print!("{}", report.render());
            }
            ParsedCommand::AnalyzeDump(path) => {
                let dump = StoredDump::load(&path)?;
                let report = crate::crash::analyze_dump(&dump)?;
                print!("{}", report.render());
            }
            ParsedCommand::SaveDump(path) => {
                let dump = self.session()?.capture_dump()?;
                dump.save(&path)?;
                println!("[*] dump saved to {}", path.display());
            }
            ParsedCommand::Help => print_help(),
            ParsedCommand::Quit => {
                if let Some(mut session) = self.session.take() {
                    if session.state() == SessionState::Attached {
                        let _ = session.detach();
                    }
                }
                return Ok(Flow::Quit);
            }
            ParsedCommand::Unknown(input) => {
                println!("{} unknown command: '{}'", "[!]".red(), input);
                println!("    type '?' for help");
            }
        }
        Ok(Flow::Continue)
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn attach_pid(&mut self, pid: u32) -> Result<()> {
        let target = crate::debug::linux::PtraceTarget::attach(pid)?;
        self.session = Some(Session::attach(Box::new(target))?);
        println!("[*] attached to pid {pid}");
        Ok(())
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn attach_pid(&mut self, _pid: u32) -> Result<()> {
        Err(DebugError::Backend {
            operation: "attach",
            reason: "live attach requires x86_64 Linux; use 'demo'".into(),
        })
    }
}

/// Built-in demo target layout, shared with the prompt banner.
mod demo {
    use crate::debug::sim::CODE_BASE;

    pub const MAIN_LOW: u64 = CODE_BASE;
    pub const MAIN_HIGH: u64 = CODE_BASE + 0x2b;
    pub const F_LOW: u64 = MAIN_HIGH;
    pub const F_HIGH: u64 = F_LOW + 6;
}

/// A small looping program with one call, for poking at the engine
/// without a live process.
fn demo_target() -> SimTarget {
    use disasm::Op;
    let loop_head = demo::MAIN_LOW + 20;
    SimTarget::with_program(&[
        Op::MovImm { dst: 2, imm: 1 },
        Op::MovImm { dst: 1, imm: 3 },
        // loop_head:
        Op::Call { target: demo::F_LOW },
        Op::Sub { dst: 1, src: 2 },
        Op::Bnz {
            cond: 1,
            target: loop_head,
        },
        Op::Halt,
        // f:
        Op::Enter,
        Op::Add { dst: 0, src: 2 },
        Op::Leave,
        Op::Ret,
    ])
}

/// Run the CLI REPL. `initial` is an already-built session (from the
/// `--pid` flag); the REPL owns it from here.
pub fn run_cli(initial: Option<Session>) -> anyhow::Result<()> {
    let mut line_editor = Reedline::create();
    let mut prompt = RiftPrompt::new();
    let mut repl = Repl::new();
    repl.session = initial;

    println!(
        "{}",
        "╔══════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        "║  Rift - interactive debugging engine. '?' for help, 'q' quits ║".cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝".cyan()
    );

    loop {
        prompt.update(repl.session.as_ref());
        let sig = line_editor.read_line(&prompt)?;
        match sig {
            Signal::Success(buffer) => {
                let input = buffer.trim();
                if input.is_empty() {
                    continue;
                }
                match repl.execute(parse_command(input)) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => {
                        println!("{} {} (code {})", "[!]".red(), e, e.exit_code());
                        if e.is_fatal_to_session() {
                            println!("{} session lost", "[!]".red());
                            repl.session = None;
                        }
                    }
                }
            }
            Signal::CtrlD | Signal::CtrlC => {
                println!("\n[*] interrupted");
                if let Some(mut session) = repl.session.take() {
                    if session.state() == SessionState::Attached {
                        let _ = session.detach();
                    }
                }
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_breakpoint_flags() {
        assert_eq!(
            parse_command("b 0x1000 --hw --once"),
            ParsedCommand::BreakpointSet {
                addr: 0x1000,
                hardware: true,
                one_shot: true,
                condition: None,
            }
        );
        assert_eq!(
            parse_command("b 4096 --if r0 == 5"),
            ParsedCommand::BreakpointSet {
                addr: 4096,
                hardware: false,
                one_shot: false,
                condition: Some("r0 == 5".to_string()),
            }
        );
        assert!(matches!(
            parse_command("b nonsense"),
            ParsedCommand::Unknown(_)
        ));
    }

    #[test]
    fn parses_watch_and_trap_management() {
        assert_eq!(
            parse_command("watch 0x5000 8 rw"),
            ParsedCommand::WatchpointSet {
                addr: 0x5000,
                len: 8,
                access: WatchAccess::ReadWrite,
            }
        );
        assert_eq!(
            parse_command("watch 0x5000 8"),
            ParsedCommand::WatchpointSet {
                addr: 0x5000,
                len: 8,
                access: WatchAccess::Write,
            }
        );
        assert_eq!(parse_command("clear 3"), ParsedCommand::Clear(3));
        assert_eq!(parse_command("disable 2"), ParsedCommand::Disable(2));
    }

    #[test]
    fn parses_disassembly_variants() {
        assert_eq!(
            parse_command("pd"),
            ParsedCommand::Disassemble {
                addr: None,
                count: 10
            }
        );
        assert_eq!(
            parse_command("pd 5 @ 0x1000"),
            ParsedCommand::Disassemble {
                addr: Some(0x1000),
                count: 5
            }
        );
        // positional spelling takes <addr> [count]
        assert_eq!(
            parse_command("disas 0x1000 5"),
            ParsedCommand::Disassemble {
                addr: Some(0x1000),
                count: 5
            }
        );
        assert_eq!(
            parse_command("disas 0x1000"),
            ParsedCommand::Disassemble {
                addr: Some(0x1000),
                count: 10
            }
        );
        assert!(matches!(
            parse_command("disas nonsense"),
            ParsedCommand::Unknown(_)
        ));
    }

    #[test]
    fn parses_step_variants() {
        assert_eq!(parse_command("s"), ParsedCommand::StepInto);
        assert_eq!(parse_command("step"), ParsedCommand::StepInto);
        assert_eq!(parse_command("step --over"), ParsedCommand::StepOver);
        assert_eq!(parse_command("n"), ParsedCommand::StepOver);
        assert!(matches!(
            parse_command("step --sideways"),
            ParsedCommand::Unknown(_)
        ));
    }

    #[test]
    fn parses_crash_commands() {
        assert_eq!(parse_command("crash"), ParsedCommand::AnalyzeCrash);
        assert_eq!(
            parse_command("crash /tmp/d.json"),
            ParsedCommand::AnalyzeDump(PathBuf::from("/tmp/d.json"))
        );
        assert_eq!(
            parse_command("analyze-crash /tmp/d.json"),
            ParsedCommand::AnalyzeDump(PathBuf::from("/tmp/d.json"))
        );
        assert_eq!(
            parse_command("dump out.json"),
            ParsedCommand::SaveDump(PathBuf::from("out.json"))
        );
    }

    #[test]
    fn demo_session_runs_to_exit() {
        let mut repl = Repl::new();
        repl.execute(ParsedCommand::Demo).unwrap();
        let ev = repl.session().unwrap().resume().unwrap();
        // r0 accumulates 1 per call, three loop iterations
        assert_eq!(ev.reason, StopReason::Exit(3));
    }

    #[test]
    fn commands_without_a_session_are_state_violations() {
        let mut repl = Repl::new();
        let err = repl.execute(ParsedCommand::Continue).unwrap_err();
        assert!(matches!(err, DebugError::StateViolation { .. }));
        assert_eq!(err.exit_code(), 4);
    }
}
