//! xtask: Development tasks for dspq
//!
//! Run with: `cargo xtask <command>`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for dspq")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests (workspace, both signaling backends, fuzz harnesses)
    Test {
        /// Only run the scenarios for one signaling backend
        #[arg(long, value_enum)]
        signaling: Option<Backend>,
    },
    /// Run fuzz tests with bolero
    Fuzz {
        /// Target to fuzz ("packet_ring", "header_word_roundtrip", "decode_garbage_ring").
        /// If not specified, runs all fuzz harnesses in test mode (quick smoke test)
        target: Option<String>,
    },
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Rpc,
    Driver,
}

impl Backend {
    fn test_target(self) -> &'static str {
        match self {
            Backend::Rpc => "rpc_signaling",
            Backend::Driver => "driver_signaling",
        }
    }
}

/// Fuzz targets and the test file each lives in.
const FUZZ_TARGETS: &[(&str, &str, &str)] = &[
    ("packet_ring", "packet_ring", "write/read/peek against a model queue"),
    ("header_word_roundtrip", "header_word", "packet header word decoding"),
    ("decode_garbage_ring", "header_word", "decoding arbitrary ring bytes"),
];

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn workspace_root() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::current_dir()?.join("xtask"),
    };
    let root = manifest_dir.parent().ok_or("xtask has no parent directory")?;
    Ok(root.to_path_buf())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.command {
        Commands::Test { signaling: Some(backend) } => {
            let target = backend.test_target();
            println!("=== Running {target} scenarios ===");
            cmd!(sh, "cargo test -p dspq --test {target}").run()?;
        }
        Commands::Test { signaling: None } => {
            println!("=== Running workspace tests ===");

            // Try nextest first, fall back to cargo test
            if cmd!(sh, "cargo nextest --version").quiet().run().is_ok() {
                println!("Using cargo-nextest");
                cmd!(sh, "cargo nextest run --workspace --exclude dspq-fuzz").run()?;
            } else {
                println!("cargo-nextest not found, using cargo test");
                cmd!(sh, "cargo test --workspace --exclude dspq-fuzz").run()?;
            }

            println!("\n=== Running fuzz harnesses (test mode) ===");
            cmd!(sh, "cargo test -p dspq-fuzz").run()?;

            println!("\n=== All tests passed ===");
        }
        Commands::Fuzz { target } => {
            if let Some(t) = target {
                let Some(&(_, file, _)) = FUZZ_TARGETS.iter().find(|(name, _, _)| *name == t) else {
                    return Err(format!("unknown fuzz target {t}").into());
                };
                println!("=== Fuzzing target: {t} ===");
                println!("Press Ctrl+C to stop.\n");

                // Check if cargo-bolero is installed
                if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                    eprintln!("cargo-bolero not found. Install with:");
                    eprintln!("  cargo install cargo-bolero");
                    return Err("cargo-bolero not installed".into());
                }

                cmd!(sh, "cargo bolero test -p dspq-fuzz --test {file} {t}").run()?;
            } else {
                println!("=== Running all fuzz harnesses in test mode ===");
                println!("(For real fuzzing, specify a target: cargo xtask fuzz packet_ring)\n");
                println!("Available targets:");
                for (name, _, what) in FUZZ_TARGETS {
                    println!("  - {name:<22} ({what})");
                }
                println!();

                cmd!(sh, "cargo test -p dspq-fuzz").run()?;
            }
        }
        Commands::Clippy => {
            println!("=== Running clippy ===");
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            if fix {
                println!("=== Fixing formatting ===");
                cmd!(sh, "cargo fmt --all").run()?;
            } else {
                println!("=== Checking formatting ===");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
            }
        }
    }

    Ok(())
}
