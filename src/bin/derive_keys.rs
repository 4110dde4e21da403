#[path = "../keys.rs"]
#[allow(dead_code)]
mod keys;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use keys::{KeyType, SectorKeys};

// Prints the sector keys of a BambuLab tag, one per line, sector 0 first.
// Usage:
//   cargo run --bin derive_keys -- DEADBEEF
//   cargo run --bin derive_keys -- "DE AD BE EF" --key-type b --mfd keys.mfd
#[derive(Parser, Debug)]
#[command(name = "derive_keys", about = "Derive Mifare sector keys from a spool tag UID")]
struct Args {
    /// Tag UID in hex; spaces and colons are ignored.
    uid: String,

    /// 16-byte master key, 32 hex chars.
    #[arg(long, env = "BAMBU_MASTER_KEY")]
    master_key: Option<String>,

    #[arg(long, value_enum, default_value = "a")]
    key_type: KeyTypeArg,

    /// Also write both key sets as a 1024-byte nfc-mfclassic key dump.
    #[arg(long)]
    mfd: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeyTypeArg {
    A,
    B,
}

fn run(args: &Args) -> Result<(), keys::KeyError> {
    let uid = keys::parse_uid(&args.uid)?;
    let master = match &args.master_key {
        Some(hex) => keys::parse_master_key(hex)?,
        None => keys::DEFAULT_MASTER_KEY,
    };
    let key_type = match args.key_type {
        KeyTypeArg::A => KeyType::A,
        KeyTypeArg::B => KeyType::B,
    };
    let sector_keys = keys::derive_sector_keys(&uid, &master, key_type)?;
    println!("{}", keys::render_key_dictionary(&sector_keys));

    if let Some(path) = &args.mfd {
        let both = SectorKeys::derive(&uid, &master)?;
        std::fs::write(path, keys::render_keys_mfd(&both))?;
        eprintln!("wrote {}", path.display());
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("derive_keys: {e}");
        std::process::exit(2);
    }
}
