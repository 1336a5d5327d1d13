//! Offline Proof Bundle Verifier
//!
//! Verifies an exported bundle with no database and no network. Anyone
//! holding the signing secret can audit a bundle on an air-gapped box.
//!
//! Usage:
//!   cargo run --bin bundle_verify -- <bundle.json> [--json]
//!
//! Exit codes:
//!   0 - bundle verified
//!   1 - bundle NOT verified
//!   2 - usage or IO error

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use trackproof_backend::ledger::bundle::ProofBundle;
use trackproof_backend::ledger::checkpoint::SecretPair;
use trackproof_backend::ledger::verify::BundleVerifier;

#[derive(Parser, Debug)]
#[command(name = "bundle_verify")]
#[command(about = "Verify an exported proof bundle without touching the ledger database")]
struct Cli {
    /// Path to the bundle JSON file
    bundle: PathBuf,

    /// Checkpoint signing secret
    #[arg(long, env = "LEDGER_SIGNING_SECRET", hide_env_values = true)]
    secret: String,

    /// Previous secret still accepted during rotation
    #[arg(long, env = "LEDGER_SIGNING_SECRET_PREVIOUS", hide_env_values = true)]
    previous_secret: Option<String>,

    /// Emit the full result as JSON instead of the text report
    #[arg(long)]
    json: bool,
}

fn read_bundle(path: &Path) -> Result<ProofBundle> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let bundle = match read_bundle(&cli.bundle) {
        Ok(bundle) => bundle,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    let secrets = match SecretPair::new(&cli.secret, cli.previous_secret) {
        Ok(secrets) => secrets,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let result = BundleVerifier::new(secrets).verify(&bundle);

    if cli.json {
        match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::from(2);
            }
        }
    } else {
        print!("{}", result.format_report());
    }

    if result.verified {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
