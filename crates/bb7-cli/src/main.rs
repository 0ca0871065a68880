//! Process entry point: parses the (minimal) process arguments, loads the
//! ambient config and global state, then hands stdin/stdout to
//! `bb7_rpc::run` for the lifetime of the process. Mirrors the teacher's
//! `main.rs` shape — `clap` for argument parsing, `anyhow::Result` at the
//! outermost boundary — even though BB-7 has no subcommands of its own: the
//! whole protocol lives inside the stdio frames `bb7-rpc` dispatches.

mod debug_log;

use anyhow::{Context, Result};
use bb7_core::{Config, GlobalState};
use clap::Parser;
use debug_log::debug_log;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// BB-7 backend: a stdio co-process mediating between an editor frontend
/// and a remote LLM provider.
#[derive(Parser)]
#[command(name = "bb7", about = "BB-7 backend co-process", long_about = None)]
struct Cli {
    /// Project root to operate against. Defaults to the current directory —
    /// the frontend is expected to launch one backend process per project.
    #[arg(long, value_name = "DIR")]
    project_root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_root = match cli.project_root {
        Some(p) => p,
        None => std::env::current_dir().context("could not determine current directory")?,
    };

    // Config and global state are both reloadable via the `bb7_init` action,
    // so a missing/invalid config at startup is not fatal here — it is
    // surfaced to the frontend the first time an action needs it.
    let config = Config::load().unwrap_or_else(|e| {
        debug_log(&format!("config load failed at startup, using defaults: {e}"));
        Config::default()
    });
    let global = GlobalState::load().unwrap_or_else(|e| {
        debug_log(&format!("global state load failed at startup, using defaults: {e}"));
        GlobalState::default()
    });

    let store = bb7_store::Store::new(&project_root);
    debug_log(&format!("bb7 starting, project_root={}", project_root.display()));

    let session = bb7_rpc::Session::new(store, project_root, config, global, io::stdout())
        .context("could not construct backend session")?;

    let stdin = io::stdin();
    bb7_rpc::run(Arc::new(session), stdin.lock())
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("stdio request loop ended with an error")?;

    debug_log("bb7 exiting cleanly");
    Ok(())
}
