//! Rift - interactive debugging and dynamic analysis engine
//!
//! Entry point: argument parsing, logger setup, and mode selection
//! between the interactive REPL and one-shot dump triage.

use clap::Parser;

use rift::crash::dump::StoredDump;
use rift::ui::cli::run_cli;

/// Rift: interactive debugging & dynamic analysis engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process id to attach to on startup
    #[arg(short, long)]
    pid: Option<u32>,

    /// Triage a stored crash dump and exit
    #[arg(long, value_name = "PATH")]
    analyze: Option<std::path::PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match std::env::args().filter(|a| a == "-v").count() {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    let args = Args::parse();
    log::info!("rift v{} starting", env!("CARGO_PKG_VERSION"));

    // one-shot triage mode: exit code is the error's result code
    if let Some(path) = args.analyze {
        match StoredDump::load(&path).and_then(|d| rift::analyze_dump(&d)) {
            Ok(report) => {
                print!("{}", report.render());
                return Ok(());
            }
            Err(e) => {
                eprintln!("[!] {e}");
                std::process::exit(e.exit_code());
            }
        }
    }

    let initial = match args.pid {
        Some(pid) => Some(attach(pid)?),
        None => None,
    };
    run_cli(initial)?;
    Ok(())
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn attach(pid: u32) -> anyhow::Result<rift::Session> {
    let target = rift::debug::linux::PtraceTarget::attach(pid)?;
    Ok(rift::Session::attach(Box::new(target))?)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn attach(pid: u32) -> anyhow::Result<rift::Session> {
    anyhow::bail!("cannot attach to pid {pid}: live attach requires x86_64 Linux")
}
