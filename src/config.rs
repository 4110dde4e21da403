//! Runtime settings resolved from the command line.
//!
//! clap already applies `flag > env > default`; this module turns the raw arguments into typed
//! settings and validates them once at startup.
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use tracing::debug;

use crate::cli::{Backend, Cli, KeyArgs, OutputArgs, ParseArgs, ScanArgs, SpoolmanArgs};
use crate::dump::DumpWriter;
use crate::error::{Error, Result};
use crate::keys;
use crate::reader::KeyPlan;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub backend: Backend,
    pub device: String,
    pub baud: u32,
    pub once: bool,
    pub scan_timeout: Duration,
    pub poll_interval: Duration,
    pub read_retries: u32,
    pub libnfc_dir: Option<PathBuf>,
    pub keys: KeyPlan,
    pub output: DumpWriter,
    /// `None` with `--no-publish`.
    pub publish: Option<PublishSettings>,
}

#[derive(Debug, Clone)]
pub struct ParseSettings {
    pub output: DumpWriter,
    pub publish: Option<PublishSettings>,
}

/// Effective log level: `--debug` wins over `--log-level`.
pub fn log_level(cli: &Cli) -> Result<&str> {
    if cli.debug {
        return Ok("debug");
    }
    let level = cli.log_level.as_str();
    if !LOG_LEVELS.contains(&level) {
        return Err(Error::Config(format!("invalid log level '{level}', expected one of {}", LOG_LEVELS.join(", "))));
    }
    Ok(level)
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::Config(format!("{name} must be a positive number of seconds, got {value}")));
    }
    Duration::try_from_secs_f64(value).map_err(|e| Error::Config(format!("{name} {value} out of range: {e}")))
}

impl PublishSettings {
    pub fn from_args(args: &SpoolmanArgs) -> Result<Self> {
        let url = Url::parse(&args.url).map_err(|e| Error::Config(format!("invalid spoolman url '{}': {e}", args.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!("spoolman url must be http or https, got '{}'", url.scheme())));
        }
        Ok(Self { url: args.url.clone(), timeout: seconds("spoolman timeout", args.timeout)? })
    }
}

impl KeyPlan {
    pub fn from_args(args: &KeyArgs) -> Result<Self> {
        let master = match &args.master_key {
            Some(hex) => keys::parse_master_key(hex)?,
            None => keys::DEFAULT_MASTER_KEY,
        };
        let fixed = match &args.keys {
            Some(path) => {
                debug!(path = %path.display(), "loading key file");
                Some(keys::load_key_file(path)?)
            }
            None => None,
        };
        Ok(Self { fixed, master, dictionary: !args.no_dictionary, show_keys: args.show_keys })
    }
}

fn writer(args: &OutputArgs) -> Result<DumpWriter> {
    if let Some(stem) = &args.outstem {
        if stem.is_empty() || stem.contains(['/', '\\']) {
            return Err(Error::Config(format!("invalid output stem '{stem}'")));
        }
    }
    Ok(DumpWriter::new(&args.outdir, args.outstem.clone()))
}

impl ScanSettings {
    pub fn from_args(args: &ScanArgs) -> Result<Self> {
        if args.poll_interval_ms == 0 {
            return Err(Error::Config("poll interval must be non-zero".into()));
        }
        if args.backend == Backend::Pn532 && args.device.is_empty() {
            return Err(Error::Config("no serial device given for the pn532 backend".into()));
        }
        let publish = if args.no_publish { None } else { Some(PublishSettings::from_args(&args.spoolman)?) };
        Ok(Self {
            backend: args.backend,
            device: args.device.clone(),
            baud: args.baud,
            once: args.once,
            scan_timeout: seconds("scan timeout", args.scan_timeout)?,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            read_retries: args.read_retries,
            libnfc_dir: args.libnfc_dir.clone(),
            keys: KeyPlan::from_args(&args.keys)?,
            output: writer(&args.output)?,
            publish,
        })
    }
}

impl ParseSettings {
    pub fn from_args(args: &ParseArgs) -> Result<Self> {
        let publish = if args.publish { Some(PublishSettings::from_args(&args.spoolman)?) } else { None };
        Ok(Self { output: writer(&args.output)?, publish })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Commands;
    use clap::Parser;

    fn scan(args: &[&str]) -> Result<ScanSettings> {
        let argv = ["spoolman-tag-reader", "scan"].into_iter().chain(args.iter().copied());
        match Cli::try_parse_from(argv).expect("cli parses").command {
            Commands::Scan(a) => ScanSettings::from_args(&a),
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn defaults_resolve() {
        let s = scan(&["--spoolman-url", "http://localhost:8000/api/spools"]).unwrap();
        assert_eq!(s.scan_timeout, Duration::from_secs(8));
        assert_eq!(s.poll_interval, Duration::from_millis(300));
        assert_eq!(s.keys.master, keys::DEFAULT_MASTER_KEY);
        assert!(s.keys.dictionary);
        assert_eq!(s.publish.unwrap().timeout, Duration::from_secs(5));
    }

    #[test]
    fn no_publish_skips_url_validation() {
        let s = scan(&["--no-publish", "--spoolman-url", "not a url"]).unwrap();
        assert!(s.publish.is_none());
    }

    #[test]
    fn rejects_bad_url_and_scheme() {
        assert!(matches!(scan(&["--spoolman-url", "not a url"]), Err(Error::Config(_))));
        assert!(matches!(scan(&["--spoolman-url", "ftp://host/spools"]), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_timeouts() {
        assert!(matches!(scan(&["--no-publish", "--scan-timeout", "0"]), Err(Error::Config(_))));
        assert!(matches!(scan(&["--no-publish", "--poll-interval-ms", "0"]), Err(Error::Config(_))));
        assert!(matches!(
            scan(&["--spoolman-url", "http://h/api", "--spoolman-timeout", "0"]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rejects_timeouts_too_large_for_duration() {
        assert!(matches!(scan(&["--no-publish", "--scan-timeout", "1e20"]), Err(Error::Config(_))));
        let err = scan(&["--spoolman-url", "http://h/api", "--spoolman-timeout", "1e20"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(matches!(seconds("scan timeout", f64::MAX), Err(Error::Config(_))));
    }

    #[test]
    fn master_key_is_validated() {
        let err = scan(&["--no-publish", "--master-key", "ABCD"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        let s = scan(&["--no-publish", "--master-key", "00112233445566778899AABBCCDDEEFF"]).unwrap();
        assert_eq!(s.keys.master[15], 0xFF);
    }

    #[test]
    fn key_file_replaces_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.dic");
        let lines: Vec<String> = (0..16).map(|i| format!("{i:02X}{i:02X}{i:02X}{i:02X}{i:02X}{i:02X}")).collect();
        std::fs::write(&path, lines.join("\n")).unwrap();
        let s = scan(&["--no-publish", "--keys", path.to_str().unwrap()]).unwrap();
        let fixed = s.keys.fixed.expect("fixed keys");
        assert_eq!(fixed.a[3].to_hex(), "030303030303");
    }

    #[test]
    fn rejects_path_in_stem() {
        assert!(matches!(scan(&["--no-publish", "--outstem", "a/b"]), Err(Error::Config(_))));
    }

    #[test]
    fn debug_flag_overrides_level() {
        let cli = Cli::try_parse_from(["spoolman-tag-reader", "--log-level", "warn", "--debug", "parse", "x.bin"]).unwrap();
        assert_eq!(log_level(&cli).unwrap(), "debug");
        let cli = Cli::try_parse_from(["spoolman-tag-reader", "--log-level", "loud", "parse", "x.bin"]).unwrap();
        assert!(log_level(&cli).is_err());
    }
}
