//! Command line definitions (clap derive). Declarative only; see `config` for validation.
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::spoolman::DEFAULT_SPOOLMAN_URL;

/// Read BambuLab filament spool tags and forward them to SpoolMan.
#[derive(Parser, Debug)]
#[command(name = "spoolman-tag-reader", version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Shorthand for `--log-level debug`.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Serve Prometheus metrics on this address, e.g. 127.0.0.1:9100.
    #[arg(long, global = true)]
    pub metrics_addr: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll a reader for tags, dump, decode and publish them.
    Scan(ScanArgs),
    /// Decode an existing dump file (.json, .bin or .mfd).
    Parse(ParseArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// PN532 over a serial port (HSU).
    Pn532,
    /// libnfc `nfc-list` / `nfc-mfclassic` tools.
    Libnfc,
}

// ---- keys ----

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// 16-byte master key, 32 hex chars.
    #[arg(long, env = "BAMBU_MASTER_KEY")]
    pub master_key: Option<String>,

    /// Use keys from this file (text dictionary or .mfd dump) instead of deriving them.
    #[arg(long)]
    pub keys: Option<PathBuf>,

    /// Do not fall back to well-known factory keys.
    #[arg(long)]
    pub no_dictionary: bool,

    /// Log the sector keys in use.
    #[arg(long)]
    pub show_keys: bool,
}

// ---- output ----

#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    #[arg(long, default_value = ".")]
    pub outdir: PathBuf,

    /// Fixed file stem instead of `bambu_<UID>_<timestamp>`.
    #[arg(long)]
    pub outstem: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SpoolmanArgs {
    #[arg(long = "spoolman-url", env = "SPOOLMAN_URL", default_value = DEFAULT_SPOOLMAN_URL)]
    pub url: String,

    /// HTTP timeout in seconds.
    #[arg(long = "spoolman-timeout", default_value_t = 5.0)]
    pub timeout: f64,
}

// ---- scan ----

#[derive(Args, Debug)]
pub struct ScanArgs {
    #[arg(long, value_enum, default_value = "pn532")]
    pub backend: Backend,

    /// Serial device of the PN532.
    #[arg(long, env = "PN532_DEVICE", default_value = "/dev/ttyUSB0")]
    pub device: String,

    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,

    /// Stop after the first tag.
    #[arg(long)]
    pub once: bool,

    /// Seconds to wait for a tag per poll window.
    #[arg(long, default_value_t = 8.0)]
    pub scan_timeout: f64,

    #[arg(long, default_value_t = 300)]
    pub poll_interval_ms: u64,

    /// Directory holding `nfc-list` and `nfc-mfclassic`; `PATH` is searched when unset.
    #[arg(long, env = "LIBNFC_BIN_DIR")]
    pub libnfc_dir: Option<PathBuf>,

    /// Extra attempts after a failed read.
    #[arg(long, default_value_t = 2)]
    pub read_retries: u32,

    /// Only write local files.
    #[arg(long)]
    pub no_publish: bool,

    #[command(flatten)]
    pub keys: KeyArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    #[command(flatten)]
    pub spoolman: SpoolmanArgs,
}

// ---- parse ----

#[derive(Args, Debug)]
pub struct ParseArgs {
    /// Dump to decode.
    pub dump: PathBuf,

    /// POST the decoded record to SpoolMan.
    #[arg(long)]
    pub publish: bool,

    #[command(flatten)]
    pub output: OutputArgs,

    #[command(flatten)]
    pub spoolman: SpoolmanArgs,
}
