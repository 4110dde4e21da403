//! Sector key derivation for BambuLab spool tags.
//!
//! BambuLab tags are Mifare Classic 1K cards whose sixteen sectors are locked with keys derived
//! from the card UID:
//! - HKDF-SHA256, input keying material = UID, salt = 16-byte master key.
//! - info `"RFID-A\0"` for key A, `"RFID-B\0"` for key B.
//! - 96 bytes of output split into sixteen consecutive 6-byte keys, one per sector.
//!
//! Also holds the key file formats understood by the reader (text dictionary and `.mfd` key
//! dumps) and the list of factory keys tried when derived keys do not open a sector.
//!
//! This module is self-contained so the `derive_keys` debug binary can include it directly.
use hex::FromHex;
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Number of sectors on a Mifare Classic 1K card.
pub const SECTOR_COUNT: usize = 16;
/// Length of a single Mifare key.
pub const KEY_LEN: usize = 6;

/// Master secret used by BambuLab for all spool tags.
pub const DEFAULT_MASTER_KEY: [u8; 16] = [
    0x9A, 0x75, 0x9C, 0xF2, 0xC4, 0xF7, 0xCA, 0xFF,
    0x22, 0x2C, 0xB9, 0x76, 0x9B, 0x41, 0xBC, 0x96,
];

/// Factory and commonly used keys, tried in order when derived keys fail.
pub const WELL_KNOWN_KEYS: [[u8; KEY_LEN]; 11] = [
    [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5],
    [0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5],
    [0x4D, 0x3A, 0x99, 0xC3, 0x51, 0xDD],
    [0x1A, 0x98, 0x2C, 0x7E, 0x45, 0x9A],
    [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
    [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6],
    [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
    [0x98, 0x76, 0x54, 0x32, 0x10, 0xFF],
];

/// Access bits written into generated sector trailers (transport configuration).
const TRAILER_ACCESS_BITS: [u8; 4] = [0xFF, 0x07, 0x80, 0x69];

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("bad hex in {what}: {source}")]
    Hex {
        what: &'static str,
        #[source]
        source: hex::FromHexError,
    },
    #[error("master key must be 16 bytes (32 hex chars), got {0} bytes")]
    MasterKeyLength(usize),
    #[error("uid must be 4, 7 or 10 bytes, got {0}")]
    UidLength(usize),
    #[error("key file {path}: {reason}")]
    KeyFile { path: String, reason: String },
    #[error("hkdf expand failed: {0}")]
    Expand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which of the two Mifare keys a value stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    A,
    B,
}

impl KeyType {
    /// Mifare authentication command byte.
    pub fn auth_command(self) -> u8 {
        match self {
            KeyType::A => 0x60,
            KeyType::B => 0x61,
        }
    }

    fn hkdf_info(self) -> &'static [u8] {
        match self {
            KeyType::A => b"RFID-A\0",
            KeyType::B => b"RFID-B\0",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::A => f.write_str("A"),
            KeyType::B => f.write_str("B"),
        }
    }
}

/// A 6-byte Mifare Classic sector key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorKey(pub [u8; KEY_LEN]);

impl SectorKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

// Keys never show up in logs unless explicitly rendered with `to_hex`.
impl fmt::Debug for SectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorKey({:02X}..)", self.0[0])
    }
}

/// Keys for every sector of one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorKeys {
    pub a: [SectorKey; SECTOR_COUNT],
    pub b: Option<[SectorKey; SECTOR_COUNT]>,
}

impl SectorKeys {
    /// Derive both key sets from a UID.
    pub fn derive(uid: &[u8], master: &[u8; 16]) -> Result<Self, KeyError> {
        Ok(Self {
            a: derive_sector_keys(uid, master, KeyType::A)?,
            b: Some(derive_sector_keys(uid, master, KeyType::B)?),
        })
    }

    pub fn key(&self, sector: usize, key_type: KeyType) -> Option<SectorKey> {
        match key_type {
            KeyType::A => self.a.get(sector).copied(),
            KeyType::B => self.b.as_ref().and_then(|b| b.get(sector).copied()),
        }
    }
}

/// Derive the sixteen sector keys of the given type for a tag UID.
pub fn derive_sector_keys(
    uid: &[u8],
    master: &[u8; 16],
    key_type: KeyType,
) -> Result<[SectorKey; SECTOR_COUNT], KeyError> {
    check_uid_len(uid.len())?;
    let hk = Hkdf::<Sha256>::new(Some(master), uid);
    let mut okm = [0u8; KEY_LEN * SECTOR_COUNT];
    hk.expand(key_type.hkdf_info(), &mut okm)
        .map_err(|e| KeyError::Expand(e.to_string()))?;
    let mut keys = [SectorKey([0u8; KEY_LEN]); SECTOR_COUNT];
    for (key, chunk) in keys.iter_mut().zip(okm.chunks_exact(KEY_LEN)) {
        key.0.copy_from_slice(chunk);
    }
    debug!(uid = %hex::encode_upper(uid), key_type = %key_type, "derived sector keys");
    Ok(keys)
}

fn check_uid_len(len: usize) -> Result<(), KeyError> {
    match len {
        4 | 7 | 10 => Ok(()),
        other => Err(KeyError::UidLength(other)),
    }
}

/// Strip the separators people paste UIDs and keys with.
fn compact_hex(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect()
}

/// Parse a UID given as hex (spaces and colons allowed).
pub fn parse_uid(s: &str) -> Result<Vec<u8>, KeyError> {
    let bytes = hex::decode(compact_hex(s)).map_err(|source| KeyError::Hex { what: "uid", source })?;
    check_uid_len(bytes.len())?;
    Ok(bytes)
}

/// Parse a 32 hex char master key.
pub fn parse_master_key(s: &str) -> Result<[u8; 16], KeyError> {
    let bytes = hex::decode(compact_hex(s))
        .map_err(|source| KeyError::Hex { what: "master key", source })?;
    <[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| KeyError::MasterKeyLength(bytes.len()))
}

/// One uppercase hex key per line, sector 0 first.
pub fn render_key_dictionary(keys: &[SectorKey]) -> String {
    keys.iter().map(SectorKey::to_hex).collect::<Vec<_>>().join("\n")
}

/// Build a 1K key dump: every sector trailer carries key A, transport access bits and key B.
/// Data blocks are zero. This is the keys file format `nfc-mfclassic` reads.
pub fn render_keys_mfd(keys: &SectorKeys) -> Vec<u8> {
    let mut out = vec![0u8; SECTOR_COUNT * 4 * 16];
    for sector in 0..SECTOR_COUNT {
        let trailer = (sector * 4 + 3) * 16;
        let b = keys.key(sector, KeyType::B).unwrap_or(SectorKey([0xFF; KEY_LEN]));
        out[trailer..trailer + 6].copy_from_slice(&keys.a[sector].0);
        out[trailer + 6..trailer + 10].copy_from_slice(&TRAILER_ACCESS_BITS);
        out[trailer + 10..trailer + 16].copy_from_slice(&b.0);
    }
    out
}

/// Parse user supplied keys: text dictionary or binary `.mfd` key dump.
pub fn parse_key_file(path: &str, content: &[u8]) -> Result<SectorKeys, KeyError> {
    if content.len() == SECTOR_COUNT * 4 * 16 {
        return Ok(keys_from_mfd(content));
    }
    let text = std::str::from_utf8(content).map_err(|_| KeyError::KeyFile {
        path: path.to_string(),
        reason: "neither a 1024-byte key dump nor a text dictionary".into(),
    })?;
    let mut a = Vec::with_capacity(SECTOR_COUNT);
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let raw = <[u8; KEY_LEN]>::from_hex(compact_hex(line)).map_err(|_| KeyError::KeyFile {
            path: path.to_string(),
            reason: format!("line {}: expected 12 hex chars, got '{line}'", lineno + 1),
        })?;
        a.push(SectorKey(raw));
    }
    if a.len() < SECTOR_COUNT {
        return Err(KeyError::KeyFile {
            path: path.to_string(),
            reason: format!("expected {SECTOR_COUNT} keys, found {}", a.len()),
        });
    }
    let mut keys_a = [SectorKey([0u8; KEY_LEN]); SECTOR_COUNT];
    keys_a.copy_from_slice(&a[..SECTOR_COUNT]);
    Ok(SectorKeys { a: keys_a, b: None })
}

/// Load a key file from disk.
pub fn load_key_file(path: &Path) -> Result<SectorKeys, KeyError> {
    let content = std::fs::read(path)?;
    parse_key_file(&path.display().to_string(), &content)
}

fn keys_from_mfd(content: &[u8]) -> SectorKeys {
    let mut a = [SectorKey([0u8; KEY_LEN]); SECTOR_COUNT];
    let mut b = [SectorKey([0u8; KEY_LEN]); SECTOR_COUNT];
    for sector in 0..SECTOR_COUNT {
        let trailer = (sector * 4 + 3) * 16;
        a[sector].0.copy_from_slice(&content[trailer..trailer + 6]);
        b[sector].0.copy_from_slice(&content[trailer + 10..trailer + 16]);
    }
    SectorKeys { a, b: Some(b) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_known_key_a_vector() {
        let uid = parse_uid("DE AD BE EF").unwrap();
        let keys = derive_sector_keys(&uid, &DEFAULT_MASTER_KEY, KeyType::A).unwrap();
        assert_eq!(keys[0].to_hex(), "045C6DC690E9");
        assert_eq!(keys[1].to_hex(), "DAF05C224715");
        assert_eq!(keys[15].to_hex(), "46CF8B20C176");
    }

    #[test]
    fn key_b_uses_its_own_context() {
        let uid = parse_uid("deadbeef").unwrap();
        let keys = SectorKeys::derive(&uid, &DEFAULT_MASTER_KEY).unwrap();
        assert_eq!(keys.key(0, KeyType::B).unwrap().to_hex(), "2572900FFE08");
        assert_eq!(keys.key(1, KeyType::B).unwrap().to_hex(), "A0A461505BBE");
        assert_ne!(keys.a[0], keys.key(0, KeyType::B).unwrap());
    }

    #[test]
    fn master_key_changes_output() {
        let uid = [0x01, 0x02, 0x03, 0x04];
        let other = parse_master_key("00112233445566778899AABBCCDDEEFF").unwrap();
        let a = derive_sector_keys(&uid, &DEFAULT_MASTER_KEY, KeyType::A).unwrap();
        let b = derive_sector_keys(&uid, &other, KeyType::A).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(matches!(parse_master_key("0011"), Err(KeyError::MasterKeyLength(2))));
        assert!(matches!(parse_uid("0102"), Err(KeyError::UidLength(2))));
        assert!(matches!(parse_uid("zz112233"), Err(KeyError::Hex { .. })));
        assert!(derive_sector_keys(&[1, 2, 3], &DEFAULT_MASTER_KEY, KeyType::A).is_err());
    }

    #[test]
    fn dictionary_renders_sixteen_lines() {
        let keys = derive_sector_keys(&[0xDE, 0xAD, 0xBE, 0xEF], &DEFAULT_MASTER_KEY, KeyType::A).unwrap();
        let text = render_key_dictionary(&keys);
        assert_eq!(text.lines().count(), 16);
        assert_eq!(text.lines().next(), Some("045C6DC690E9"));
        let parsed = parse_key_file("keys.dic", text.as_bytes()).unwrap();
        assert_eq!(parsed.a, keys);
        assert!(parsed.b.is_none());
    }

    #[test]
    fn dictionary_skips_comments_and_requires_sixteen_keys() {
        let short = "# derived\nFFFFFFFFFFFF\n\nA0A1A2A3A4A5\n";
        let err = parse_key_file("short.dic", short.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("expected 16 keys, found 2"));
        let bad = "FFFFFFFFFFF\n";
        assert!(parse_key_file("bad.dic", bad.as_bytes()).unwrap_err().to_string().contains("line 1"));
    }

    #[test]
    fn keys_mfd_places_keys_in_trailers() {
        let keys = SectorKeys::derive(&[0xDE, 0xAD, 0xBE, 0xEF], &DEFAULT_MASTER_KEY).unwrap();
        let mfd = render_keys_mfd(&keys);
        assert_eq!(mfd.len(), 1024);
        // sector 0 trailer is block 3
        assert_eq!(&mfd[48..54], keys.a[0].as_bytes());
        assert_eq!(&mfd[54..58], &TRAILER_ACCESS_BITS);
        assert_eq!(&mfd[58..64], keys.key(0, KeyType::B).unwrap().as_bytes());
        assert!(mfd[0..48].iter().all(|&b| b == 0));
        assert_eq!(parse_key_file("keys.mfd", &mfd).unwrap(), keys);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = SectorKey([0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45]);
        assert_eq!(format!("{key:?}"), "SectorKey(AB..)");
    }
}
