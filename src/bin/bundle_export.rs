//! Proof Bundle Export Tool
//!
//! Exports a verifiable bundle straight from a ledger database, for
//! hand-off to auditors or archival. The daemon does not need to be
//! running.
//!
//! Usage:
//!   cargo run --bin bundle_export -- <INSTANCE_ID> [--from N] [--to N] [-o out.json]

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use trackproof_backend::ledger::bundle::BundleGenerator;
use trackproof_backend::ledger::store::LedgerStore;

#[derive(Parser, Debug)]
#[command(name = "bundle_export")]
#[command(about = "Export a proof bundle from a ledger database")]
struct Cli {
    /// Instance to export
    instance_id: String,

    /// Path to the SQLite database
    #[arg(long, env = "LEDGER_DB_PATH", default_value = "data/ledger.db")]
    db_path: String,

    /// First sequence number (default 1)
    #[arg(long)]
    from: Option<u64>,

    /// Last sequence number (default: chain head)
    #[arg(long)]
    to: Option<u64>,

    /// Output file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn run(cli: &Cli) -> Result<()> {
    let store = Arc::new(LedgerStore::open(&cli.db_path)?);
    let bundle = BundleGenerator::new(store)
        .generate(&cli.instance_id, cli.from, cli.to)
        .with_context(|| format!("Failed to generate bundle for {}", cli.instance_id))?;

    match &cli.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), &bundle)?;
            eprintln!(
                "Exported events {}..{} of {} to {}",
                bundle.report.manifest.from_seq_no,
                bundle.report.manifest.to_seq_no,
                cli.instance_id,
                path.display()
            );
        }
        None => {
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            serde_json::to_writer_pretty(&mut out, &bundle)?;
            out.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
