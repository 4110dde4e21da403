//! PN532 driver over the HSU (UART) host interface.
//!
//! Frame layout (normal information frame):
//! ```text
//! 00 00 FF | LEN | LCS | TFI | PD0..PDn | DCS | 00
//! ```
//! - `LEN` counts TFI + data bytes, `LEN + LCS == 0 (mod 256)`.
//! - `TFI + sum(PD) + DCS == 0 (mod 256)`.
//! - TFI is `D4` host -> PN532 and `D5` PN532 -> host; the response code is command + 1.
//! - Every command is first acknowledged with `00 00 FF 00 FF 00`.
//!
//! Only the handful of commands needed to dump a Mifare Classic card are implemented:
//! SAMConfiguration, GetFirmwareVersion, RFConfiguration (retries), InListPassiveTarget,
//! InDataExchange (Mifare auth / read) and InRelease.
use std::io::{Read, Write};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::keys::{KeyType, SectorKey};
use crate::mifare::{Block, Target, Uid, BLOCK_LEN};
use crate::reader::MifareReader;

const HOST_TO_PN532: u8 = 0xD4;
const PN532_TO_HOST: u8 = 0xD5;
/// TFI of the application level error frame.
const ERROR_TFI: u8 = 0x7F;

const CMD_GET_FIRMWARE_VERSION: u8 = 0x02;
const CMD_SAM_CONFIGURATION: u8 = 0x14;
const CMD_RF_CONFIGURATION: u8 = 0x32;
const CMD_IN_DATA_EXCHANGE: u8 = 0x40;
const CMD_IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
const CMD_IN_RELEASE: u8 = 0x52;

const MIFARE_READ: u8 = 0x30;

/// 106 kbps type A (ISO/IEC 14443A).
const BAUD_TYPE_A: u8 = 0x00;
/// RFConfiguration item: MaxRetries.
const RF_ITEM_MAX_RETRIES: u8 = 0x05;
/// InListPassiveTarget activation retries before reporting an empty field.
const PASSIVE_RETRIES: u8 = 0x10;

/// Bytes discarded while looking for a start code before giving up.
const MAX_SYNC_BYTES: usize = 64;

/// HSU wake-up sequence: the chip needs a long preamble after power save.
const WAKEUP: [u8; 16] = [0x55, 0x55, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

pub const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_millis(1000);

/// A decoded frame from the chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    ApplicationError,
    /// Bytes following TFI (response code first).
    Data(Vec<u8>),
}

/// Build a host -> PN532 information frame.
pub fn encode_frame(command: u8, params: &[u8]) -> Vec<u8> {
    let len = (params.len() + 2) as u8;
    let mut out = Vec::with_capacity(params.len() + 9);
    out.extend_from_slice(&[0x00, 0x00, 0xFF, len, len.wrapping_neg(), HOST_TO_PN532, command]);
    out.extend_from_slice(params);
    let sum = params
        .iter()
        .fold(HOST_TO_PN532.wrapping_add(command), |acc, &b| acc.wrapping_add(b));
    out.push(sum.wrapping_neg());
    out.push(0x00);
    out
}

/// Decode one complete frame. Leading bytes before the `00 FF` start code are ignored.
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    let start = buf
        .windows(2)
        .position(|w| w == [0x00, 0xFF])
        .ok_or_else(|| Error::Protocol("no start code".into()))?;
    let rest = &buf[start + 2..];
    if rest.len() < 2 {
        return Err(Error::Protocol("truncated header".into()));
    }
    let (len, lcs) = (rest[0], rest[1]);
    match (len, lcs) {
        (0x00, 0xFF) => return Ok(Frame::Ack),
        (0xFF, 0x00) => return Ok(Frame::Nack),
        _ => {}
    }
    if len.wrapping_add(lcs) != 0 {
        return Err(Error::Protocol(format!("length checksum mismatch (len 0x{len:02x}, lcs 0x{lcs:02x})")));
    }
    let len = len as usize;
    if rest.len() < 2 + len + 1 {
        return Err(Error::Protocol(format!("truncated frame: need {} bytes, have {}", len + 3, rest.len())));
    }
    let body = &rest[2..2 + len];
    let dcs = rest[2 + len];
    if body.iter().fold(dcs, |acc, &b| acc.wrapping_add(b)) != 0 {
        return Err(Error::Protocol(format!("data checksum mismatch: {}", hex::encode(body))));
    }
    match body.first() {
        Some(&ERROR_TFI) => Ok(Frame::ApplicationError),
        Some(&PN532_TO_HOST) => Ok(Frame::Data(body[1..].to_vec())),
        Some(other) => Err(Error::Protocol(format!("unexpected TFI 0x{other:02x}"))),
        None => Err(Error::Protocol("empty frame".into())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub ic: u8,
    pub version: u8,
    pub revision: u8,
    pub support: u8,
}

/// PN532 attached to a byte transport (a serial port in production).
pub struct Pn532<T> {
    port: T,
}

impl Pn532<Box<dyn serialport::SerialPort>> {
    /// Open the serial device and bring the chip into normal mode.
    pub fn open_serial(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud).timeout(DEFAULT_SERIAL_TIMEOUT).open()?;
        let mut pn = Pn532::new(port);
        let fw = pn.begin()?;
        info!(
            device = path,
            baud,
            ic = format!("0x{:02x}", fw.ic),
            version = fw.version,
            revision = fw.revision,
            support = format!("0x{:02x}", fw.support),
            "pn532 ready"
        );
        Ok(pn)
    }
}

impl<T: Read + Write> Pn532<T> {
    pub fn new(port: T) -> Self {
        Self { port }
    }

    /// Wake the chip, configure the SAM and the activation retries.
    pub fn begin(&mut self) -> Result<FirmwareVersion> {
        self.port.write_all(&WAKEUP)?;
        self.sam_configure()?;
        let fw = self.firmware_version()?;
        self.set_passive_retries(PASSIVE_RETRIES)?;
        Ok(fw)
    }

    pub fn sam_configure(&mut self) -> Result<()> {
        // normal mode, 50ms * 20 timeout, use IRQ
        self.command(CMD_SAM_CONFIGURATION, &[0x01, 0x14, 0x01])?;
        Ok(())
    }

    pub fn firmware_version(&mut self) -> Result<FirmwareVersion> {
        let r = self.command(CMD_GET_FIRMWARE_VERSION, &[])?;
        if r.len() < 4 {
            return Err(Error::Protocol(format!("short firmware response: {}", hex::encode(&r))));
        }
        Ok(FirmwareVersion { ic: r[0], version: r[1], revision: r[2], support: r[3] })
    }

    pub fn set_passive_retries(&mut self, retries: u8) -> Result<()> {
        // MxRtyATR, MxRtyPSL, MxRtyPassiveActivation
        self.command(CMD_RF_CONFIGURATION, &[RF_ITEM_MAX_RETRIES, 0xFF, 0x01, retries])?;
        Ok(())
    }

    /// Look for one ISO14443A target.
    pub fn in_list_passive_target(&mut self) -> Result<Option<Target>> {
        let r = self.command(CMD_IN_LIST_PASSIVE_TARGET, &[0x01, BAUD_TYPE_A])?;
        let count = *r.first().ok_or_else(|| Error::Protocol("empty InListPassiveTarget response".into()))?;
        match count {
            0 => return Ok(None),
            1 => {}
            n => return Err(Error::MultipleTargets(n)),
        }
        // Tg, SENS_RES(2), SEL_RES, NFCIDLength, NFCID1..
        if r.len() < 6 {
            return Err(Error::Protocol(format!("short target data: {}", hex::encode(&r))));
        }
        let atqa = u16::from_be_bytes([r[2], r[3]]);
        let sak = r[4];
        let uid_len = r[5] as usize;
        let uid = r
            .get(6..6 + uid_len)
            .ok_or_else(|| Error::Protocol(format!("uid length {uid_len} exceeds response")))?;
        Ok(Some(Target { uid: Uid::new(uid.to_vec()), atqa, sak }))
    }

    pub fn in_release(&mut self) -> Result<()> {
        self.command(CMD_IN_RELEASE, &[0x00])?;
        Ok(())
    }

    /// Exchange data with target 1. Inner `Err` carries a non-zero status byte.
    pub fn in_data_exchange(&mut self, data: &[u8]) -> Result<std::result::Result<Vec<u8>, u8>> {
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(0x01);
        params.extend_from_slice(data);
        let r = self.command(CMD_IN_DATA_EXCHANGE, &params)?;
        let status = *r.first().ok_or_else(|| Error::Protocol("empty InDataExchange response".into()))?;
        if status & 0x3F != 0 {
            return Ok(Err(status));
        }
        Ok(Ok(r[1..].to_vec()))
    }

    /// Send a command, wait for the ACK and return the response payload after the response code.
    fn command(&mut self, command: u8, params: &[u8]) -> Result<Vec<u8>> {
        let frame = encode_frame(command, params);
        debug!(command = format!("0x{command:02x}"), frame = %hex::encode(&frame), "pn532 ->");
        self.port.write_all(&frame)?;
        self.port.flush()?;

        match self.read_frame()? {
            Frame::Ack => {}
            Frame::Nack => return Err(Error::Protocol(format!("command 0x{command:02x} NACKed"))),
            other => return Err(Error::Protocol(format!("expected ACK for 0x{command:02x}, got {other:?}"))),
        }
        match self.read_frame()? {
            Frame::Data(body) => {
                debug!(command = format!("0x{command:02x}"), body = %hex::encode(&body), "pn532 <-");
                match body.split_first() {
                    Some((&code, rest)) if code == command.wrapping_add(1) => Ok(rest.to_vec()),
                    _ => Err(Error::Protocol(format!(
                        "unexpected response to 0x{command:02x}: {}",
                        hex::encode(&body)
                    ))),
                }
            }
            Frame::ApplicationError => Err(Error::Protocol(format!("application error for 0x{command:02x}"))),
            other => Err(Error::Protocol(format!("expected response for 0x{command:02x}, got {other:?}"))),
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.port.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Read bytes up to the end of the next frame.
    fn read_frame(&mut self) -> Result<Frame> {
        let mut prev = 0x01u8;
        let mut skipped = 0usize;
        loop {
            let b = self.read_byte()?;
            if prev == 0x00 && b == 0xFF {
                break;
            }
            prev = b;
            skipped += 1;
            if skipped > MAX_SYNC_BYTES {
                return Err(Error::Protocol("no start code in response".into()));
            }
        }
        let len = self.read_byte()?;
        let lcs = self.read_byte()?;
        let mut buf = vec![0x00, 0xFF, len, lcs];
        let remaining = match (len, lcs) {
            (0x00, 0xFF) | (0xFF, 0x00) => 1,
            _ => len as usize + 2,
        };
        let start = buf.len();
        buf.resize(start + remaining, 0);
        self.port.read_exact(&mut buf[start..])?;
        decode_frame(&buf)
    }
}

impl<T: Read + Write> MifareReader for Pn532<T> {
    fn detect(&mut self) -> Result<Option<Target>> {
        self.in_list_passive_target()
    }

    fn authenticate(&mut self, target: &Target, block: usize, key_type: KeyType, key: &SectorKey) -> Result<bool> {
        let mut data = Vec::with_capacity(12);
        data.push(key_type.auth_command());
        data.push(block as u8);
        data.extend_from_slice(key.as_bytes());
        data.extend_from_slice(target.uid.auth_bytes());
        match self.in_data_exchange(&data)? {
            Ok(_) => Ok(true),
            Err(status) => {
                debug!(block, key_type = %key_type, status = format!("0x{status:02x}"), "mifare auth rejected");
                Ok(false)
            }
        }
    }

    fn read_block(&mut self, block: usize) -> Result<Block> {
        match self.in_data_exchange(&[MIFARE_READ, block as u8])? {
            Ok(data) if data.len() >= BLOCK_LEN => {
                let mut out = [0u8; BLOCK_LEN];
                out.copy_from_slice(&data[..BLOCK_LEN]);
                Ok(out)
            }
            Ok(data) => Err(Error::Read { block, reason: format!("short read of {} bytes", data.len()) }),
            Err(status) => Err(Error::Read { block, reason: format!("status 0x{status:02x}") }),
        }
    }

    fn reselect(&mut self, target: &Target) -> Result<bool> {
        self.in_release()?;
        Ok(matches!(self.in_list_passive_target()?, Some(t) if t.uid == target.uid))
    }
}
