//! Mifare Classic 1K geometry and the raw tag model.
//!
//! A 1K card has 16 sectors of 4 blocks, 16 bytes each. The last block of every sector is the
//! trailer (key A | access bits | key B). Block 0 is the manufacturer block and starts with the UID.
use serde::{Deserialize, Serialize};
use std::fmt;

pub const BLOCK_LEN: usize = 16;
pub const BLOCKS_PER_SECTOR: usize = 4;
pub const SECTORS_1K: usize = 16;
pub const BLOCKS_1K: usize = SECTORS_1K * BLOCKS_PER_SECTOR;

pub type Block = [u8; BLOCK_LEN];

pub fn sector_of(block: usize) -> usize {
    block / BLOCKS_PER_SECTOR
}

pub fn first_block(sector: usize) -> usize {
    sector * BLOCKS_PER_SECTOR
}

pub fn is_trailer(block: usize) -> bool {
    block % BLOCKS_PER_SECTOR == BLOCKS_PER_SECTOR - 1
}

/// Card UID (NFCID1), 4, 7 or 10 bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Uid(Vec<u8>);

impl Uid {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The four bytes Mifare Classic authentication is computed over (last four of the UID).
    pub fn auth_bytes(&self) -> &[u8] {
        let n = self.0.len();
        &self.0[n.saturating_sub(4)..]
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.to_hex())
    }
}

/// A card found in the reader field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub uid: Uid,
    /// SENS_RES
    pub atqa: u16,
    /// SEL_RES
    pub sak: u8,
}

impl Target {
    pub fn is_classic_1k(&self) -> bool {
        self.atqa == 0x0004 && matches!(self.sak, 0x08 | 0x09)
    }
}

/// Raw memory read from one tag. Blocks are addressed by absolute index; blocks of sectors that
/// could not be authenticated are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDump {
    uid: Uid,
    blocks: Vec<Option<Block>>,
}

/// `{index, data}` entry of the JSON dump format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockEntry {
    pub index: usize,
    pub data: String,
}

impl TagDump {
    pub fn new(uid: Uid, blocks: Vec<Option<Block>>) -> Self {
        Self { uid, blocks }
    }

    /// Build from a contiguous image, e.g. a `.bin`/`.mfd` file. Trailing partial blocks are dropped.
    pub fn from_image(uid: Uid, image: &[u8]) -> Self {
        let blocks = image
            .chunks_exact(BLOCK_LEN)
            .map(|c| {
                let mut b = [0u8; BLOCK_LEN];
                b.copy_from_slice(c);
                Some(b)
            })
            .collect();
        Self { uid, blocks }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Total number of block slots, present or not.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Option::is_none)
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index).and_then(Option::as_ref)
    }

    /// Present blocks in index order.
    pub fn present(&self) -> impl Iterator<Item = (usize, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (i, b)))
    }

    pub fn present_count(&self) -> usize {
        self.present().count()
    }

    /// Sectors with no readable block.
    pub fn missing_sectors(&self) -> Vec<usize> {
        let sectors = self.blocks.len().div_ceil(BLOCKS_PER_SECTOR);
        (0..sectors)
            .filter(|&s| {
                (first_block(s)..first_block(s) + BLOCKS_PER_SECTOR).all(|b| self.block(b).is_none())
            })
            .collect()
    }

    /// Contiguous image with zero bytes in place of missing blocks.
    pub fn to_image(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.blocks.len() * BLOCK_LEN);
        for b in &self.blocks {
            match b {
                Some(b) => out.extend_from_slice(b),
                None => out.extend_from_slice(&[0u8; BLOCK_LEN]),
            }
        }
        out
    }

    /// Hex of all present blocks concatenated in index order.
    pub fn raw_hex(&self) -> String {
        let mut s = String::with_capacity(self.blocks.len() * BLOCK_LEN * 2);
        for (_, b) in self.present() {
            s.push_str(&hex::encode(b));
        }
        s
    }

    pub fn entries(&self) -> Vec<BlockEntry> {
        self.present()
            .map(|(index, b)| BlockEntry { index, data: hex::encode_upper(b) })
            .collect()
    }

    /// Rebuild from JSON entries; gaps between indices become missing blocks.
    /// Indices past the end of a 1K card are rejected.
    pub fn from_entries(uid: Uid, entries: &[BlockEntry]) -> Result<Self, String> {
        if let Some(e) = entries.iter().find(|e| e.index >= BLOCKS_1K) {
            return Err(format!("block index {} out of range (0..{BLOCKS_1K})", e.index));
        }
        let len = entries.iter().map(|e| e.index + 1).max().unwrap_or(0);
        let mut blocks = vec![None; len];
        for e in entries {
            let bytes = hex::decode(e.data.trim()).map_err(|err| format!("block {}: {err}", e.index))?;
            let block = <Block>::try_from(bytes.as_slice())
                .map_err(|_| format!("block {}: expected {BLOCK_LEN} bytes, got {}", e.index, bytes.len()))?;
            blocks[e.index] = Some(block);
        }
        Ok(Self { uid, blocks })
    }
}
