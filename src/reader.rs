//! Reader seam and the sector-by-sector dump strategy.
//!
//! - [`MifareReader`] is the block-level interface a hardware driver provides (PN532).
//! - [`TagSource`] is what the scan loop consumes: detect a card, then read it into a [`TagDump`].
//! - [`ClassicSource`] adapts any [`MifareReader`] into a [`TagSource`]: keys come from the
//!   [`KeyPlan`], each sector is opened with its key A, then key B, then the well-known keys.
use std::thread;
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::keys::{self, KeyType, SectorKey, SectorKeys, WELL_KNOWN_KEYS};
use crate::mifare::{first_block, Block, TagDump, Target, BLOCKS_1K, BLOCKS_PER_SECTOR, SECTORS_1K};

/// Block-level access to a Mifare Classic card.
pub trait MifareReader {
    /// One detection attempt. `Ok(None)` when the field is empty.
    fn detect(&mut self) -> Result<Option<Target>>;
    /// `Ok(false)` when the card rejected the key. The card is halted afterwards.
    fn authenticate(&mut self, target: &Target, block: usize, key_type: KeyType, key: &SectorKey) -> Result<bool>;
    fn read_block(&mut self, block: usize) -> Result<Block>;
    /// Select the card again after a halt. `Ok(false)` if it is no longer in the field.
    fn reselect(&mut self, target: &Target) -> Result<bool>;
}

/// Something that yields tag dumps: a hardware reader or an external tool.
pub trait TagSource {
    /// Wait up to the configured scan window for a single card.
    fn detect(&mut self) -> Result<Option<Target>>;
    fn read(&mut self, target: &Target) -> Result<TagDump>;
}

/// Where sector keys come from.
#[derive(Debug, Clone)]
pub struct KeyPlan {
    /// User supplied keys; derivation is skipped when present.
    pub fixed: Option<SectorKeys>,
    pub master: [u8; 16],
    /// Try [`WELL_KNOWN_KEYS`] after the derived keys.
    pub dictionary: bool,
    pub show_keys: bool,
}

impl Default for KeyPlan {
    fn default() -> Self {
        Self { fixed: None, master: keys::DEFAULT_MASTER_KEY, dictionary: true, show_keys: false }
    }
}

impl KeyPlan {
    pub fn keys_for(&self, target: &Target) -> Result<SectorKeys> {
        let keys = match &self.fixed {
            Some(k) => k.clone(),
            None => SectorKeys::derive(target.uid.as_bytes(), &self.master)?,
        };
        if self.show_keys {
            info!(uid = %target.uid, keys = %keys::render_key_dictionary(&keys.a).replace('\n', " "), "sector keys (A)");
        }
        Ok(keys)
    }

    /// Ordered key candidates for one sector.
    pub fn candidates(&self, keys: &SectorKeys, sector: usize) -> Vec<(KeyType, SectorKey)> {
        let mut out = Vec::new();
        for kt in [KeyType::A, KeyType::B] {
            if let Some(k) = keys.key(sector, kt) {
                out.push((kt, k));
            }
        }
        if self.dictionary {
            for raw in WELL_KNOWN_KEYS {
                for kt in [KeyType::A, KeyType::B] {
                    let k = SectorKey(raw);
                    if !out.contains(&(kt, k)) {
                        out.push((kt, k));
                    }
                }
            }
        }
        out
    }
}

/// Read every sector of a 1K card. Sectors no key opens are left out of the dump.
pub fn read_dump<R: MifareReader>(reader: &mut R, target: &Target, plan: &KeyPlan) -> Result<TagDump> {
    let keys = plan.keys_for(target)?;
    let mut blocks: Vec<Option<Block>> = vec![None; BLOCKS_1K];
    let mut read_sectors = 0usize;

    for sector in 0..SECTORS_1K {
        let first = first_block(sector);
        let mut opened = None;
        for (kt, key) in plan.candidates(&keys, sector) {
            match reader.authenticate(target, first, kt, &key) {
                Ok(true) => {
                    opened = Some(kt);
                    break;
                }
                Ok(false) => debug!(sector, key_type = %kt, "key rejected"),
                Err(e) => debug!(sector, key_type = %kt, error = %e, "authenticate failed"),
            }
            if !reader.reselect(target)? {
                return Err(Error::Read { block: first, reason: "tag left the field".into() });
            }
        }
        let Some(kt) = opened else {
            counter!("tag.sector.skipped").increment(1);
            warn!(uid = %target.uid, sector, "no key opened sector, skipping");
            continue;
        };

        let mut sector_blocks = Vec::with_capacity(BLOCKS_PER_SECTOR);
        for block in first..first + BLOCKS_PER_SECTOR {
            match reader.read_block(block) {
                Ok(data) => sector_blocks.push(data),
                Err(e) => {
                    warn!(uid = %target.uid, sector, block, error = %e, "read failed, skipping sector");
                    break;
                }
            }
        }
        if sector_blocks.len() != BLOCKS_PER_SECTOR {
            counter!("tag.sector.skipped").increment(1);
            if !reader.reselect(target)? {
                return Err(Error::Read { block: first, reason: "tag left the field".into() });
            }
            continue;
        }
        for (offset, data) in sector_blocks.into_iter().enumerate() {
            blocks[first + offset] = Some(data);
        }
        read_sectors += 1;
        debug!(sector, key_type = %kt, "sector read");
    }

    if read_sectors == 0 {
        return Err(Error::Authentication(format!("no sector of {} could be authenticated", target.uid)));
    }
    info!(uid = %target.uid, sectors = read_sectors, "tag dumped");
    Ok(TagDump::new(target.uid.clone(), blocks))
}

/// [`TagSource`] over a block-level reader.
pub struct ClassicSource<R> {
    reader: R,
    plan: KeyPlan,
    scan_timeout: Duration,
    poll_interval: Duration,
    needs_reselect: bool,
}

impl<R: MifareReader> ClassicSource<R> {
    pub fn new(reader: R, plan: KeyPlan, scan_timeout: Duration, poll_interval: Duration) -> Self {
        Self { reader, plan, scan_timeout, poll_interval, needs_reselect: false }
    }
}

impl<R: MifareReader> TagSource for ClassicSource<R> {
    fn detect(&mut self) -> Result<Option<Target>> {
        poll_until(self.scan_timeout, self.poll_interval, || self.reader.detect())
    }

    fn read(&mut self, target: &Target) -> Result<TagDump> {
        if self.needs_reselect && !self.reader.reselect(target)? {
            return Err(Error::Read { block: 0, reason: "tag left the field".into() });
        }
        let res = read_dump(&mut self.reader, target, &self.plan);
        self.needs_reselect = res.is_err();
        res
    }
}

/// Repeat `attempt` until it yields a target or `timeout` elapses. Several cards in the field
/// and transient reader errors are logged and polled through.
pub fn poll_until<F>(timeout: Duration, interval: Duration, mut attempt: F) -> Result<Option<Target>>
where
    F: FnMut() -> Result<Option<Target>>,
{
    let start = Instant::now();
    loop {
        match attempt() {
            Ok(Some(t)) => return Ok(Some(t)),
            Ok(None) => {}
            Err(Error::MultipleTargets(n)) => debug!(targets = n, "more than one card in field"),
            Err(e @ (Error::Serial(_) | Error::Io(_) | Error::Command { .. })) => return Err(e),
            Err(e) => warn!(error = %e, "detect failed"),
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::DEFAULT_MASTER_KEY;
    use crate::mifare::{sector_of, Uid, BLOCK_LEN};

    /// In-memory Mifare Classic card with per-sector keys and halt-on-failure behavior.
    pub(crate) struct MemoryCard {
        pub target: Target,
        pub blocks: Vec<Block>,
        pub keys_a: Vec<SectorKey>,
        pub keys_b: Vec<SectorKey>,
        pub in_field: bool,
        pub detect_errors: Vec<Error>,
        pub unreadable: Vec<usize>,
        authed: Option<usize>,
        halted: bool,
        pub auth_attempts: usize,
    }

    impl MemoryCard {
        pub fn bambu(uid: [u8; 4], blocks: Vec<Block>) -> Self {
            let keys = SectorKeys::derive(&uid, &DEFAULT_MASTER_KEY).unwrap();
            Self {
                target: Target { uid: Uid::new(uid.to_vec()), atqa: 0x0004, sak: 0x08 },
                blocks,
                keys_a: keys.a.to_vec(),
                keys_b: keys.b.unwrap().to_vec(),
                in_field: true,
                detect_errors: Vec::new(),
                unreadable: Vec::new(),
                authed: None,
                halted: false,
                auth_attempts: 0,
            }
        }
    }

    impl MifareReader for MemoryCard {
        fn detect(&mut self) -> Result<Option<Target>> {
            if let Some(e) = self.detect_errors.pop() {
                return Err(e);
            }
            Ok(self.in_field.then(|| self.target.clone()))
        }

        fn authenticate(&mut self, target: &Target, block: usize, kt: KeyType, key: &SectorKey) -> Result<bool> {
            self.auth_attempts += 1;
            if self.halted || target.uid != self.target.uid {
                return Ok(false);
            }
            let sector = sector_of(block);
            let expected = match kt {
                KeyType::A => self.keys_a[sector],
                KeyType::B => self.keys_b[sector],
            };
            if expected == *key {
                self.authed = Some(sector);
                Ok(true)
            } else {
                self.authed = None;
                self.halted = true;
                Ok(false)
            }
        }

        fn read_block(&mut self, block: usize) -> Result<Block> {
            if self.halted || self.authed != Some(sector_of(block)) || self.unreadable.contains(&block) {
                return Err(Error::Read { block, reason: "not authenticated".into() });
            }
            Ok(self.blocks[block])
        }

        fn reselect(&mut self, _target: &Target) -> Result<bool> {
            self.halted = false;
            self.authed = None;
            Ok(self.in_field)
        }
    }

    pub(crate) fn numbered_blocks() -> Vec<Block> {
        (0..BLOCKS_1K).map(|i| [i as u8; BLOCK_LEN]).collect()
    }

    #[test]
    fn derived_keys_open_every_sector() {
        let mut card = MemoryCard::bambu([0xDE, 0xAD, 0xBE, 0xEF], numbered_blocks());
        let target = card.target.clone();
        let dump = read_dump(&mut card, &target, &KeyPlan::default()).unwrap();
        assert_eq!(dump.present_count(), 64);
        assert_eq!(dump.block(17), Some(&[17u8; BLOCK_LEN]));
        assert_eq!(card.auth_attempts, 16);
    }

    #[test]
    fn dictionary_key_opens_sector_with_factory_key() {
        let mut card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        card.keys_a[3] = SectorKey([0xFF; 6]);
        card.keys_b[3] = SectorKey([0x11; 6]);
        let target = card.target.clone();
        let dump = read_dump(&mut card, &target, &KeyPlan::default()).unwrap();
        assert_eq!(dump.present_count(), 64);
        assert!(dump.missing_sectors().is_empty());
    }

    #[test]
    fn unknown_sector_is_skipped_without_dictionary() {
        let mut card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        card.keys_a[2] = SectorKey([0x42; 6]);
        card.keys_b[2] = SectorKey([0x43; 6]);
        let target = card.target.clone();
        let plan = KeyPlan { dictionary: false, ..KeyPlan::default() };
        let dump = read_dump(&mut card, &target, &plan).unwrap();
        assert_eq!(dump.missing_sectors(), vec![2]);
        assert!(dump.block(8).is_none());
        assert_eq!(dump.block(12), Some(&[12u8; BLOCK_LEN]));
    }

    #[test]
    fn unreadable_block_drops_whole_sector() {
        let mut card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        card.unreadable.push(21);
        let target = card.target.clone();
        let dump = read_dump(&mut card, &target, &KeyPlan::default()).unwrap();
        assert_eq!(dump.missing_sectors(), vec![5]);
        assert!(dump.block(20).is_none());
    }

    #[test]
    fn wrong_master_key_fails_authentication() {
        let mut card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        let target = card.target.clone();
        let plan = KeyPlan { master: [0u8; 16], dictionary: false, ..KeyPlan::default() };
        let err = read_dump(&mut card, &target, &plan).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn fixed_keys_skip_derivation() {
        let mut card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        let keys = SectorKeys::derive(&[1, 2, 3, 4], &DEFAULT_MASTER_KEY).unwrap();
        let target = card.target.clone();
        let plan = KeyPlan { fixed: Some(SectorKeys { a: keys.a, b: None }), master: [0u8; 16], ..KeyPlan::default() };
        assert_eq!(read_dump(&mut card, &target, &plan).unwrap().present_count(), 64);
    }

    #[test]
    fn tag_leaving_field_aborts() {
        let mut card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        card.keys_a[0] = SectorKey([0x42; 6]);
        card.in_field = false;
        let target = card.target.clone();
        let err = read_dump(&mut card, &target, &KeyPlan::default()).unwrap_err();
        assert!(err.to_string().contains("left the field"));
    }

    #[test]
    fn candidates_put_derived_keys_first() {
        let keys = SectorKeys::derive(&[1, 2, 3, 4], &DEFAULT_MASTER_KEY).unwrap();
        let plan = KeyPlan::default();
        let c = plan.candidates(&keys, 0);
        assert_eq!(c[0], (KeyType::A, keys.a[0]));
        assert_eq!(c[1].0, KeyType::B);
        assert_eq!(c.len(), 2 + WELL_KNOWN_KEYS.len() * 2);
        let plain = KeyPlan { dictionary: false, ..KeyPlan::default() };
        assert_eq!(plain.candidates(&keys, 0).len(), 2);
    }

    #[test]
    fn clean_read_does_not_reselect() {
        let card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        let target = card.target.clone();
        let mut source = ClassicSource::new(card, KeyPlan::default(), Duration::from_secs(1), Duration::from_millis(1));
        source.read(&target).unwrap();
        assert!(!source.needs_reselect);
        // A reselect would report the tag gone; the second read must not ask for one.
        source.reader.in_field = false;
        assert_eq!(source.read(&target).unwrap().present_count(), 64);
    }

    #[test]
    fn failed_read_reselects_before_next_attempt() {
        let card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        let target = card.target.clone();
        let plan = KeyPlan { master: [0u8; 16], dictionary: false, ..KeyPlan::default() };
        let mut source = ClassicSource::new(card, plan, Duration::from_secs(1), Duration::from_millis(1));
        assert!(matches!(source.read(&target), Err(Error::Authentication(_))));
        assert!(source.needs_reselect);

        source.reader.in_field = false;
        let attempts = source.reader.auth_attempts;
        let err = source.read(&target).unwrap_err();
        assert!(matches!(err, Error::Read { block: 0, .. }), "{err}");
        assert_eq!(source.reader.auth_attempts, attempts);

        source.reader.in_field = true;
        source.plan = KeyPlan::default();
        assert_eq!(source.read(&target).unwrap().present_count(), 64);
        assert!(!source.needs_reselect);
    }

    #[test]
    fn poll_rides_through_multiple_targets() {
        let mut card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        card.detect_errors.push(Error::MultipleTargets(2));
        let mut source = ClassicSource::new(card, KeyPlan::default(), Duration::from_secs(1), Duration::from_millis(1));
        let target = source.detect().unwrap().expect("target");
        assert_eq!(target.uid.to_hex(), "01020304");
    }

    #[test]
    fn poll_times_out_on_empty_field() {
        let mut card = MemoryCard::bambu([1, 2, 3, 4], numbered_blocks());
        card.in_field = false;
        let mut source = ClassicSource::new(card, KeyPlan::default(), Duration::from_millis(20), Duration::from_millis(5));
        assert!(source.detect().unwrap().is_none());
    }
}
