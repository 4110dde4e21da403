//! Block parser: turns a [`TagDump`] into named spool fields.
//!
//! Two decodings are attempted, in order:
//! - legacy JSON payload: the printable bytes of user memory form a JSON object
//!   (`spool_id`, `material`, `color`, `weight_grams`),
//! - Bambu layout: fixed fields at fixed block offsets, little-endian integers and floats,
//!   NUL padded ASCII strings.
//!
//! Blocks are addressed by absolute index, so a sector that could not be read only hides the
//! fields stored in it.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::mifare::{is_trailer, TagDump};

/// Which decoding produced a [`ParsedSpool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decoding {
    Layout,
    LegacyJson,
    None,
}

/// The record forwarded downstream. Every field stays `None` until decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSpool {
    pub uid: String,
    pub spool_id: Option<String>,
    pub material: Option<String>,
    pub color: Option<String>,
    pub weight_grams: Option<u32>,
    pub decoding: Decoding,
    /// Present blocks, hex, for audit.
    pub raw_hex: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Temperatures {
    pub drying_temp_c: u16,
    pub drying_time_h: u16,
    pub bed_temp_type: u16,
    pub bed_temp_c: u16,
    pub max_hotend_c: u16,
    pub min_hotend_c: u16,
}

/// All fields of the Bambu block layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BambuTag {
    pub uid: Option<String>,
    pub variant_id: Option<String>,
    pub material_id: Option<String>,
    pub filament_type: Option<String>,
    pub detailed_filament_type: Option<String>,
    /// `#RRGGBBAA`, a second entry for dual color spools.
    pub colors: Vec<String>,
    pub color_count: Option<u16>,
    pub spool_weight_g: Option<u16>,
    pub filament_diameter_mm: Option<f64>,
    pub temperatures: Option<Temperatures>,
    pub x_cam_info: Option<String>,
    pub nozzle_diameter_mm: Option<f64>,
    pub tray_uid: Option<String>,
    pub spool_width_mm: Option<f64>,
    pub production_date: Option<String>,
    pub production_date_short: Option<String>,
    pub filament_length_m: Option<u16>,
}

impl BambuTag {
    /// A blank or foreign tag decodes to zeros everywhere; only the id strings tell them apart.
    pub fn is_identified(&self) -> bool {
        self.filament_type.is_some()
            || self.detailed_filament_type.is_some()
            || self.material_id.is_some()
            || self.variant_id.is_some()
    }
}

/// Outcome of decoding one dump.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub spool: ParsedSpool,
    /// Set when the Bambu layout identified the tag.
    pub tag: Option<BambuTag>,
}

fn ascii(data: &[u8]) -> Option<String> {
    let s: String = data
        .iter()
        .filter(|&&b| b == 0 || (b.is_ascii() && !b.is_ascii_control()))
        .map(|&b| if b == 0 { ' ' } else { b as char })
        .collect();
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn le_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[0], data[1]])
}

fn le_f32(data: &[u8], decimals: i32) -> Option<f64> {
    let v = f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64;
    if !v.is_finite() {
        return None;
    }
    let scale = 10f64.powi(decimals);
    Some((v * scale).round() / scale)
}

fn color(data: &[u8]) -> String {
    format!("#{}", hex::encode_upper(data))
}

/// `YYYY_MM_DD_HH_MM` -> `YYYY-MM-DD HH:MM`; anything else is returned as is.
fn production_date(data: &[u8]) -> Option<String> {
    let s = ascii(data)?;
    let parts: Vec<&str> = s.split('_').collect();
    if parts.len() >= 5 {
        return Some(format!("{}-{}-{} {}:{}", parts[0], parts[1], parts[2], parts[3], parts[4]));
    }
    Some(s)
}

/// Decode the Bambu layout.
pub fn parse_layout(dump: &TagDump) -> BambuTag {
    let b = |i: usize| dump.block(i);
    let mut tag = BambuTag::default();

    if let Some(b0) = b(0) {
        tag.uid = Some(hex::encode_upper(&b0[0..4]));
    }
    if let Some(b1) = b(1) {
        tag.variant_id = ascii(&b1[0..8]);
        tag.material_id = ascii(&b1[8..16]);
    }
    tag.filament_type = b(2).and_then(|d| ascii(d));
    tag.detailed_filament_type = b(4).and_then(|d| ascii(d));

    if let Some(b5) = b(5) {
        tag.colors.push(color(&b5[0..4]));
        tag.spool_weight_g = Some(le_u16(&b5[4..6]));
        tag.filament_diameter_mm = le_f32(&b5[8..12], 3);
    }
    if let Some(b6) = b(6) {
        tag.temperatures = Some(Temperatures {
            drying_temp_c: le_u16(&b6[0..2]),
            drying_time_h: le_u16(&b6[2..4]),
            bed_temp_type: le_u16(&b6[4..6]),
            bed_temp_c: le_u16(&b6[6..8]),
            max_hotend_c: le_u16(&b6[8..10]),
            min_hotend_c: le_u16(&b6[10..12]),
        });
    }
    if let Some(b8) = b(8) {
        tag.x_cam_info = Some(hex::encode_upper(&b8[0..12]));
        tag.nozzle_diameter_mm = le_f32(&b8[12..16], 1);
    }
    tag.tray_uid = b(9).filter(|d| d.iter().any(|&x| x != 0)).map(hex::encode_upper);
    tag.spool_width_mm = b(10).map(|d| le_u16(&d[4..6]) as f64 / 100.0);
    tag.production_date = b(12).and_then(|d| production_date(d));
    tag.production_date_short = b(13).and_then(|d| ascii(d));
    tag.filament_length_m = b(14).map(|d| le_u16(&d[4..6]));

    if let Some(b16) = b(16) {
        let count = if b16[0..2] == [0x02, 0x00] { le_u16(&b16[2..4]) } else { 1 };
        tag.color_count = Some(count);
        if count == 2 {
            let mut second = [0u8; 4];
            second.copy_from_slice(&b16[4..8]);
            second.reverse();
            tag.colors.push(color(&second));
        }
    }
    tag
}

/// Printable bytes of all present data blocks, parsed as a JSON object.
/// Sector trailers are left out: their access bits contain printable bytes.
pub fn parse_legacy_json(dump: &TagDump) -> Option<serde_json::Map<String, Value>> {
    let text: String = dump
        .present()
        .filter(|(i, _)| !is_trailer(*i))
        .flat_map(|(_, b)| b.iter())
        .filter(|&&c| (32..=126).contains(&c))
        .map(|&c| c as char)
        .collect();
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn json_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Decode a dump into a [`ParsedSpool`] and, when it applies, the full [`BambuTag`].
pub fn decode(dump: &TagDump) -> Decoded {
    let uid = dump.uid().to_hex();
    let raw_hex = dump.raw_hex();

    if let Some(info) = parse_legacy_json(dump) {
        debug!(uid = %uid, "legacy json payload");
        let spool = ParsedSpool {
            uid,
            spool_id: Some(json_string(info.get("spool_id")).unwrap_or_else(|| "unknown".into())),
            material: json_string(info.get("material")),
            color: json_string(info.get("color")),
            weight_grams: info.get("weight_grams").and_then(Value::as_u64).and_then(|w| u32::try_from(w).ok()),
            decoding: Decoding::LegacyJson,
            raw_hex,
        };
        return Decoded { spool, tag: None };
    }

    let tag = parse_layout(dump);
    if !tag.is_identified() {
        debug!(uid = %uid, "no known fields in dump");
        let spool = ParsedSpool {
            uid,
            spool_id: None,
            material: None,
            color: None,
            weight_grams: None,
            decoding: Decoding::None,
            raw_hex,
        };
        return Decoded { spool, tag: None };
    }

    let spool = ParsedSpool {
        spool_id: tag.tray_uid.clone().or_else(|| tag.uid.clone()),
        material: tag.filament_type.clone().or_else(|| tag.detailed_filament_type.clone()),
        color: tag.colors.first().cloned(),
        weight_grams: tag.spool_weight_g.map(u32::from),
        decoding: Decoding::Layout,
        uid,
        raw_hex,
    };
    Decoded { spool, tag: Some(tag) }
}
