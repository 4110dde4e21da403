//! Crate error type and process exit code mapping.
use crate::keys::KeyError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed or unexpected PN532 frame.
    #[error("pn532 protocol error: {0}")]
    Protocol(String),

    #[error("more than one card detected ({0} targets)")]
    MultipleTargets(u8),

    #[error("no tag detected within {0:?}")]
    NoTag(std::time::Duration),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("read of block {block} failed: {reason}")]
    Read { block: usize, reason: String },

    /// An external reader tool exited unsuccessfully.
    #[error("command `{program}` failed ({status}): {output}")]
    Command { program: String, status: String, output: String },

    #[error("invalid dump {path}: {reason}")]
    InvalidDump { path: String, reason: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("spoolman rejected the record: {status} {body}")]
    Rejected { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// | Code | Meaning                       |
    /// |------|-------------------------------|
    /// | 1    | general failure               |
    /// | 2    | configuration / key input     |
    /// | 3    | no tag in the field           |
    /// | 4    | tag authentication failed     |
    /// | 10   | io                            |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Key(_) => 2,
            Self::NoTag(_) => 3,
            Self::Authentication(_) => 4,
            Self::Io(_) => 10,
            _ => 1,
        }
    }
}
