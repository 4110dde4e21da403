//! Scan loop: detect, read, decode, persist, publish.
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::task::block_in_place;
use tracing::{debug, error, info, warn};

use crate::config::ScanSettings;
use crate::dump::{DumpWriter, WrittenFiles};
use crate::error::{Error, Result};
use crate::mifare::{TagDump, Target, Uid};
use crate::parser::{self, Decoded, Decoding};
use crate::reader::TagSource;
use crate::spoolman::{Ack, Publisher, SpoolRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// No publisher configured, or nothing was decoded.
    Skipped,
    Acked(Ack),
    Failed(String),
}

#[derive(Debug)]
pub struct Processed {
    pub decoded: Decoded,
    pub files: WrittenFiles,
    pub publish: PublishOutcome,
}

/// Decode one dump, write its files and hand the record to the publisher.
/// A failed publish is reported in the outcome; only file errors abort.
pub async fn process_dump<P: Publisher>(dump: &TagDump, writer: &DumpWriter, publisher: Option<&P>) -> Result<Processed> {
    let decoded = parser::decode(dump);
    let spool = &decoded.spool;
    info!(
        uid = %spool.uid,
        decoding = ?spool.decoding,
        spool_id = ?spool.spool_id,
        material = ?spool.material,
        color = ?spool.color,
        weight_grams = ?spool.weight_grams,
        "tag decoded"
    );
    let missing = dump.missing_sectors();
    if !missing.is_empty() {
        warn!(uid = %spool.uid, ?missing, "dump is incomplete");
    }

    let files = writer.write(dump, &decoded)?;

    let publish = match publisher {
        None => PublishOutcome::Skipped,
        Some(_) if spool.decoding == Decoding::None => {
            warn!(uid = %spool.uid, "nothing decoded, not publishing");
            PublishOutcome::Skipped
        }
        Some(p) => match p.publish(&SpoolRecord::from(spool)).await {
            Ok(ack) => {
                info!(uid = %spool.uid, status = ack.status, response = ?ack.body, "spool published");
                PublishOutcome::Acked(ack)
            }
            Err(e) => {
                error!(uid = %spool.uid, error = %e, "publish failed");
                PublishOutcome::Failed(e.to_string())
            }
        },
    };
    Ok(Processed { decoded, files, publish })
}

/// Read with up to `retries` extra attempts.
fn read_with_retries<S: TagSource>(source: &mut S, target: &Target, retries: u32) -> Result<TagDump> {
    let mut attempt = 0;
    loop {
        let start = Instant::now();
        match source.read(target) {
            Ok(dump) => {
                counter!("tag.read.ok").increment(1);
                histogram!("tag.read.latency_ms").record(start.elapsed().as_secs_f64() * 1000.0);
                return Ok(dump);
            }
            Err(e) => {
                counter!("tag.read.err").increment(1);
                if attempt >= retries {
                    return Err(e);
                }
                attempt += 1;
                warn!(uid = %target.uid, attempt, retries, error = %e, "read failed, retrying");
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub processed: usize,
    pub failed: usize,
}

/// Poll `source` and process every new tag. Returns after the first tag with `once`.
///
/// A tag is processed once per visit: its UID is remembered until a poll window passes with no
/// tag in the field. Reader calls block, so the runtime must be multi-threaded; the loop awaits
/// between detection windows, so callers can race it against a shutdown signal.
pub async fn run_scan<S, P>(source: &mut S, settings: &ScanSettings, publisher: Option<&P>) -> Result<ScanStats>
where
    S: TagSource,
    P: Publisher,
{
    let mut stats = ScanStats::default();
    let mut last_uid: Option<Uid> = None;
    info!(once = settings.once, timeout = ?settings.scan_timeout, "waiting for tags");

    loop {
        let Some(target) = block_in_place(|| source.detect())? else {
            if settings.once {
                return Err(Error::NoTag(settings.scan_timeout));
            }
            if let Some(uid) = last_uid.take() {
                debug!(uid = %uid, "tag left the field");
            }
            // Yield between windows so a pending Ctrl-C or shutdown can win the select.
            tokio::time::sleep(settings.poll_interval).await;
            continue;
        };

        if last_uid.as_ref() == Some(&target.uid) {
            tokio::time::sleep(settings.poll_interval).await;
            continue;
        }
        counter!("tag.detected").increment(1);
        info!(uid = %target.uid, atqa = format!("0x{:04X}", target.atqa), sak = format!("0x{:02X}", target.sak), "tag detected");
        if !target.is_classic_1k() {
            warn!(uid = %target.uid, "not a Mifare Classic 1K tag, reading anyway");
        }
        last_uid = Some(target.uid.clone());

        let dump = match block_in_place(|| read_with_retries(source, &target, settings.read_retries)) {
            Ok(dump) => dump,
            Err(e) if settings.once => return Err(e),
            Err(e) => {
                stats.failed += 1;
                error!(uid = %target.uid, error = %e, "giving up on tag");
                tokio::time::sleep(settings.poll_interval).await;
                continue;
            }
        };
        process_dump(&dump, &settings.output, publisher).await?;
        stats.processed += 1;
        if settings.once {
            return Ok(stats);
        }
    }
}
