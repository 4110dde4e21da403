//! Reader backed by the libnfc command line tools.
//!
//! - `nfc-list -v` detects the card; UID, ATQA and SAK are scraped from its report.
//! - `nfc-mfclassic r a <dump.mfd> <keys.mfd>` dumps the card with keys taken from the sector
//!   trailers of a generated key dump.
//!
//! `nfc-mfclassic` can print "authentication failed" and still exit 0, so its output is inspected
//! and turned into an authentication error naming the failing block and sector. The failing
//! sector is retried with the factory key dictionary when the key plan allows it.
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::keys::{self, SectorKey, SectorKeys, SECTOR_COUNT};
use crate::mifare::{sector_of, TagDump, Target, Uid};
use crate::reader::{poll_until, KeyPlan, TagSource};

static UID_PATTERNS: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"UID\s*\(NFCID1\)\s*:\s*([0-9A-Fa-f]{2}(?:[ \t]+[0-9A-Fa-f]{2}){3,9})").unwrap(),
        Regex::new(r"NFCID1\s*:\s*([0-9A-Fa-f]{2}(?:[ \t]+[0-9A-Fa-f]{2}){3,9})").unwrap(),
    ]
});
static ATQA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ATQA[^:\n]*:\s*(0x[0-9A-Fa-f]{4}|[0-9A-Fa-f]{2}[ \t]+[0-9A-Fa-f]{2})").unwrap());
static SAK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"SAK[^:\n]*:\s*(?:0x)?([0-9A-Fa-f]{2})").unwrap());
static CLASSIC_1K_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)MIFARE\s+Classic\s+1K").unwrap());
static AUTH_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)block\s+(0x[0-9A-Fa-f]+|\d+)").unwrap());
static AUTH_SECTOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)sector\s+(0x[0-9A-Fa-f]+|\d+)").unwrap());

fn parse_int(s: &str) -> Option<usize> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => usize::from_str_radix(h, 16).ok(),
        None => s.parse().ok(),
    }
}

fn compact(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Extract the first target from an `nfc-list -v` report.
pub fn parse_nfc_list(output: &str) -> Option<Target> {
    let uid_hex = UID_PATTERNS
        .iter()
        .find_map(|re| re.captures(output))
        .map(|c| compact(&c[1]))?;
    let uid = hex::decode(uid_hex).ok()?;

    let mut atqa = ATQA_RE
        .captures(output)
        .and_then(|c| u16::from_str_radix(compact(&c[1]).trim_start_matches("0x"), 16).ok())
        .unwrap_or(0);
    let mut sak = SAK_RE
        .captures(output)
        .and_then(|c| u8::from_str_radix(&c[1], 16).ok())
        .unwrap_or(0);
    if CLASSIC_1K_RE.is_match(output) && (atqa, sak) == (0, 0) {
        atqa = 0x0004;
        sak = 0x08;
    }
    Some(Target { uid: Uid::new(uid), atqa, sak })
}

/// Locate an authentication failure in `nfc-mfclassic` output.
/// `None` when the output reports no failure.
pub fn diagnose_auth_failure(output: &str, exit_ok: bool) -> Option<String> {
    if exit_ok && !output.to_lowercase().contains("authentication failed") {
        return None;
    }
    if let Some(block) = AUTH_BLOCK_RE.captures(output).and_then(|c| parse_int(&c[1])) {
        return Some(format!("block {block} (0x{block:02X}, sector {})", sector_of(block)));
    }
    if let Some(sector) = AUTH_SECTOR_RE.captures(output).and_then(|c| parse_int(&c[1])) {
        return Some(format!("sector {sector}"));
    }
    Some("unknown block (wrong keys?)".into())
}

/// Sector named by an authentication failure, when the output gives one.
fn failed_sector(output: &str) -> Option<usize> {
    AUTH_BLOCK_RE
        .captures(output)
        .and_then(|c| parse_int(&c[1]))
        .map(sector_of)
        .or_else(|| AUTH_SECTOR_RE.captures(output).and_then(|c| parse_int(&c[1])))
        .filter(|&s| s < SECTOR_COUNT)
}

/// [`TagSource`] running the libnfc tools.
pub struct LibnfcSource {
    plan: KeyPlan,
    scan_timeout: Duration,
    poll_interval: Duration,
    workdir: tempfile::TempDir,
    nfc_list: String,
    nfc_mfclassic: String,
}

impl LibnfcSource {
    pub fn new(plan: KeyPlan, scan_timeout: Duration, poll_interval: Duration) -> Result<Self> {
        Ok(Self {
            plan,
            scan_timeout,
            poll_interval,
            workdir: tempfile::tempdir()?,
            nfc_list: "nfc-list".into(),
            nfc_mfclassic: "nfc-mfclassic".into(),
        })
    }

    /// Run other executables than the ones on `PATH`.
    pub fn with_programs(mut self, nfc_list: impl Into<String>, nfc_mfclassic: impl Into<String>) -> Self {
        self.nfc_list = nfc_list.into();
        self.nfc_mfclassic = nfc_mfclassic.into();
        self
    }

    fn dump_path(&self, uid: &Uid) -> PathBuf {
        self.workdir.path().join(format!("{}.mfd", uid.to_hex()))
    }

    /// One `nfc-mfclassic` run with `keys` written to a fresh key dump.
    fn mfclassic(&self, dump_path: &Path, keys: &SectorKeys) -> Result<(bool, String)> {
        let keys_file = tempfile::Builder::new().prefix("keys_").suffix(".mfd").tempfile_in(self.workdir.path())?;
        std::fs::write(keys_file.path(), keys::render_keys_mfd(keys))?;
        run(&self.nfc_mfclassic, &["r", "a", path_arg(dump_path)?, path_arg(keys_file.path())?])
    }
}

fn run(program: &str, args: &[&str]) -> Result<(bool, String)> {
    debug!(program, ?args, "running");
    let out = Command::new(program).args(args).output().map_err(|e| Error::Command {
        program: program.to_string(),
        status: "spawn failed".into(),
        output: e.to_string(),
    })?;
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    Ok((out.status.success(), text))
}

impl TagSource for LibnfcSource {
    fn detect(&mut self) -> Result<Option<Target>> {
        let program = self.nfc_list.clone();
        poll_until(self.scan_timeout, self.poll_interval, || {
            let (_, out) = run(&program, &["-v"])?;
            Ok(parse_nfc_list(&out))
        })
    }

    /// Dump with the planned keys. With the dictionary enabled, a sector that fails
    /// authentication gets the next factory key and the dump is retried.
    fn read(&mut self, target: &Target) -> Result<TagDump> {
        let mut keys = self.plan.keys_for(target)?;
        let mut next_key = [0usize; SECTOR_COUNT];
        let dump_path = self.dump_path(&target.uid);
        loop {
            let (ok, out) = self.mfclassic(&dump_path, &keys)?;
            let Some(where_) = diagnose_auth_failure(&out, ok) else {
                let image = std::fs::read(&dump_path).map_err(|e| Error::Command {
                    program: self.nfc_mfclassic.clone(),
                    status: format!("no dump at {}", dump_path.display()),
                    output: format!("{e}\n{out}"),
                })?;
                info!(uid = %target.uid, bytes = image.len(), "nfc-mfclassic dump complete");
                return Ok(TagDump::from_image(target.uid.clone(), &image));
            };

            let fallback = failed_sector(&out).filter(|_| self.plan.dictionary).and_then(|sector| {
                let key = keys::WELL_KNOWN_KEYS.get(next_key[sector])?;
                next_key[sector] += 1;
                Some((sector, SectorKey(*key)))
            });
            let Some((sector, key)) = fallback else {
                warn!(uid = %target.uid, at = %where_, "nfc-mfclassic authentication failed");
                return Err(Error::Authentication(format!("{} at {where_}", target.uid)));
            };
            debug!(uid = %target.uid, sector, attempt = next_key[sector], "retrying sector with dictionary key");
            keys.a[sector] = key;
            if let Some(b) = keys.b.as_mut() {
                b[sector] = key;
            }
        }
    }
}

fn path_arg(p: &Path) -> Result<&str> {
    p.to_str()
        .ok_or_else(|| Error::Config(format!("non utf-8 path {}", p.display())))
}
