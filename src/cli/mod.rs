//! Command-line surface for the `dfl-peer` binary.
//!
//! Grounded on the teacher's `Cli`/`Commands` split (a top-level `Parser`
//! with global args plus a `Subcommand` enum), trimmed to the two things a
//! peer process actually does: generate a network's key material once, and
//! run as a peer against a loaded config.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dfl-peer")]
#[command(about = "Runs one peer of the anonymous transport, or generates its key material")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Runs a peer process using the given config file.
    Run {
        /// Path to a YAML config file. Falls back to built-in defaults plus
        /// environment overrides if it does not exist.
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Generates private/public key files for a fresh network of `n_nodes`
    /// peers, writing `node<id>.priv` for each and one shared `network.pub`.
    Keygen {
        #[arg(long)]
        n_nodes: u32,
        #[arg(long, default_value = "./keys")]
        out_dir: PathBuf,
    },
}
