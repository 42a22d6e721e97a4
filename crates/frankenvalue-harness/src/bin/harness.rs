//! CLI entrypoint for the frankenvalue harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;

use frankenvalue::{CacheConfig, cache_config};
use frankenvalue_harness::{ChurnParams, ConvergeParams, run_churn, run_converge};

/// Stress tooling for frankenvalue.
#[derive(Debug, Parser)]
#[command(name = "frankenvalue-harness")]
#[command(about = "Stress and convergence harness for frankenvalue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Race threads on first reads and check they all see one value.
    Converge {
        /// Reader threads per round.
        #[arg(long, default_value_t = 8)]
        threads: usize,
        /// Fresh definition/context pairs to race on.
        #[arg(long, default_value_t = 100)]
        rounds: usize,
        /// Busy-work iterations inside each computation.
        #[arg(long, default_value_t = 1_000)]
        spin: u32,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Seeded random get/remove/put traffic checked against a reference model.
    Churn {
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Number of operations.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Size of the definition pool.
        #[arg(long, default_value_t = 64)]
        definitions: usize,
        #[arg(long)]
        initial_entries: Option<usize>,
        #[arg(long)]
        probe_limit: Option<usize>,
        /// Load limit as a percentage of capacity.
        #[arg(long)]
        load_limit: Option<u8>,
        #[arg(long)]
        max_entries: Option<usize>,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective cache configuration (environment applied).
    Config {
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct ConfigReport {
    effective: CacheConfig,
    defaults: CacheConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Converge {
            threads,
            rounds,
            spin,
            output,
        } => {
            eprintln!("Racing {threads} threads over {rounds} rounds");
            let report = run_converge(&ConvergeParams {
                threads,
                rounds,
                spin,
            })?;
            emit(&report, output.as_deref())?;
        }
        Command::Churn {
            seed,
            ops,
            definitions,
            initial_entries,
            probe_limit,
            load_limit,
            max_entries,
            output,
        } => {
            let defaults = ChurnParams::default();
            let config = CacheConfig {
                initial_entries: initial_entries.unwrap_or(defaults.config.initial_entries),
                probe_limit: probe_limit.unwrap_or(defaults.config.probe_limit),
                load_limit_percent: load_limit.unwrap_or(defaults.config.load_limit_percent),
                max_entries: max_entries.unwrap_or(defaults.config.max_entries),
            };
            let params = ChurnParams {
                seed: parse_seed(&seed)?,
                ops,
                definitions,
                config,
            };
            eprintln!("Churning {ops} ops over {definitions} definitions (seed {seed})");
            let report = run_churn(&params)?;
            emit(&report, output.as_deref())?;
        }
        Command::Config { output } => {
            let report = ConfigReport {
                effective: cache_config(),
                defaults: CacheConfig::default(),
            };
            emit(&report, output.as_deref())?;
        }
    }

    Ok(())
}

fn emit<T: Serialize>(report: &T, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let body = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => {
            std::fs::write(path, format!("{body}\n"))?;
            eprintln!("Wrote report to {}", path.display());
        }
        None => println!("{body}"),
    }
    Ok(())
}

fn parse_seed(raw: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = raw.trim();
    let seed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)?
    } else {
        s.replace('_', "").parse::<u64>()?
    };
    Ok(seed)
}
