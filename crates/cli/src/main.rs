//! # CLI - Universe Interactive Shell
//!
//! A REPL over a Universe store. Reads commands from stdin, runs each one as
//! its own expansion or index query, and prints results to stdout. Piping
//! commands through stdin works the same as typing them.
//!
//! ## Commands
//!
//! ```text
//! PUT key=value ...  Commit one atom (keys are numbers, integer values stay integers)
//! GET id             Print the atom in slot `id` (or "(nil)")
//! FIND key=value     Exact lookup through the "by-<key>" index
//! SCAN [key]         List the global index, or the "by-<key>" index
//! INDICES            List registered indices
//! STATS              Print store debug info
//! EXIT / QUIT        Close the store and leave
//! ```
//!
//! ## Configuration
//!
//! ```text
//! UNIVERSE_PATH              data file               (default: "universe.db")
//! UNIVERSE_SYNC              fsync every commit      (default: "true")
//! UNIVERSE_HOSTED_THRESHOLD  bytes kept in the file  (default: 65536)
//! UNIVERSE_GLOBAL_ORDER      asc | desc              (default: "desc")
//! UNIVERSE_REPAIR_TORN_TAIL  cut a torn last record  (default: "false")
//! UNIVERSE_READ_ONLY         refuse commits          (default: "false")
//! UNIVERSE_DEFAULT_INDEXING  update indices eagerly  (default: "false")
//! RUST_LOG                   log filter for stderr   (default: "warn")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! Universe started (ucn=1, atoms=0, path=universe.db, order=desc)
//! > PUT 1=alice 2=30
//! OK id=0 ucn=1
//! > GET 0
//! #0@1 {1="alice", 2=30}
//! > EXIT
//! bye
//! ```

mod shell;

use anyhow::{Context, Result};
use config::UniverseConfig;
use shell::{Reply, Shell};
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;
use universe::Universe;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let config = UniverseConfig::from_env();
    let store = Universe::open_or_create(config.clone())
        .with_context(|| format!("failed to open {}", config.path.display()))?;

    println!(
        "Universe started (ucn={}, atoms={}, path={}, order={})",
        store.ucn(),
        store.atom_count(),
        config.path.display(),
        config.global_order
    );
    println!("Commands: PUT key=value ... | GET id | FIND key=value | SCAN [key]");
    println!("          INDICES | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let shell = Shell::new(store);
    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        match shell.execute(&line) {
            Reply::Lines(lines) => {
                for l in lines {
                    println!("{}", l);
                }
            }
            Reply::Exit => {
                println!("bye");
                break;
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    shell.into_store().close()?;
    Ok(())
}
