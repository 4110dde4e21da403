//! Dump files on disk.
//!
//! Per tag, under `<outdir>/<stem>`:
//! - `.bin`          contiguous image, zeros for unreadable blocks
//! - `.json`         `{uid, blocks: [{index, data}]}` of the readable blocks
//! - `.parsed.json`  the [`ParsedSpool`]
//! - `.spoolman.json` the [`SpoolmanPayload`], only for Bambu layout tags
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::keys;
use crate::mifare::{BlockEntry, TagDump, Uid, BLOCK_LEN};
use crate::parser::Decoded;
use crate::spoolman::SpoolmanPayload;

#[derive(Debug, Serialize, Deserialize)]
struct DumpFile {
    uid: String,
    blocks: Vec<BlockEntry>,
}

/// `bambu_<UID>_<YYYYmmdd_HHMMSS>`
pub fn output_stem(uid: &Uid, at: DateTime<Local>) -> String {
    format!("bambu_{}_{}", uid.to_hex(), at.format("%Y%m%d_%H%M%S"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFiles {
    pub bin: PathBuf,
    pub json: PathBuf,
    pub parsed: PathBuf,
    pub spoolman: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DumpWriter {
    outdir: PathBuf,
    outstem: Option<String>,
}

impl DumpWriter {
    /// A fixed `outstem` is reused for every tag, so later tags overwrite earlier ones.
    pub fn new(outdir: impl Into<PathBuf>, outstem: Option<String>) -> Self {
        Self { outdir: outdir.into(), outstem }
    }

    pub fn write(&self, dump: &TagDump, decoded: &Decoded) -> Result<WrittenFiles> {
        fs::create_dir_all(&self.outdir)?;
        let stem = match &self.outstem {
            Some(s) => s.clone(),
            None => output_stem(dump.uid(), Local::now()),
        };
        let base = self.outdir.join(&stem);
        let path = |ext: &str| PathBuf::from(format!("{}{ext}", base.display()));

        let bin = path(".bin");
        fs::write(&bin, dump.to_image())?;

        let json = path(".json");
        let file = DumpFile { uid: dump.uid().to_hex(), blocks: dump.entries() };
        fs::write(&json, serde_json::to_vec_pretty(&file)?)?;

        let parsed = path(".parsed.json");
        fs::write(&parsed, serde_json::to_vec_pretty(&decoded.spool)?)?;

        let spoolman = match &decoded.tag {
            Some(tag) => {
                let p = path(".spoolman.json");
                fs::write(&p, serde_json::to_vec_pretty(&SpoolmanPayload::from(tag))?)?;
                Some(p)
            }
            None => None,
        };
        info!(uid = %dump.uid(), path = %base.display(), blocks = dump.present_count(), "dump written");
        Ok(WrittenFiles { bin, json, parsed, spoolman })
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> Error {
    Error::InvalidDump { path: path.display().to_string(), reason: reason.into() }
}

/// Load a `.json` block dump or a raw `.bin`/`.mfd` image.
pub fn load_dump(path: &Path) -> Result<TagDump> {
    let bytes = fs::read(path)?;
    let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        let file: DumpFile = serde_json::from_slice(&bytes).map_err(|e| invalid(path, e.to_string()))?;
        let uid = keys::parse_uid(&file.uid).map_err(|e| invalid(path, e.to_string()))?;
        let dump = TagDump::from_entries(Uid::new(uid), &file.blocks).map_err(|e| invalid(path, e))?;
        debug!(path = %path.display(), blocks = dump.present_count(), "loaded json dump");
        return Ok(dump);
    }
    if bytes.is_empty() || bytes.len() % BLOCK_LEN != 0 {
        return Err(invalid(path, format!("{} bytes is not a whole number of {BLOCK_LEN}-byte blocks", bytes.len())));
    }
    let uid = Uid::new(bytes[0..4].to_vec());
    debug!(path = %path.display(), bytes = bytes.len(), uid = %uid, "loaded raw dump");
    Ok(TagDump::from_image(uid, &bytes))
}
