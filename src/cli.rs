//! Command-line arguments: `clap::Parser` derive struct, following
//! the same shape `mkfs.wfs` uses for its own options.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "tfhfs", about = "Mount an encrypted content-addressed filesystem")]
pub struct Args {
    /// Where to mount the filesystem.
    pub mountdir: PathBuf,

    /// Where the backend keeps its blocks. Only meaningful once a
    /// persistent backend exists; the in-memory backend ignores it
    /// beyond using it as the salt-reuse key.
    pub storedir: PathBuf,

    #[arg(long)]
    pub password: String,

    /// Hex-encoded salt. Omit on first mount of a fresh store to have
    /// one generated; pass the salt a prior mount generated to reopen
    /// the same store.
    #[arg(long)]
    pub salt: Option<String>,

    #[arg(long, default_value = "memory")]
    pub backend: String,

    /// Repeat for more verbosity: unset is `warn`, `-v` is `info`,
    /// `-vv` is `debug`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub fn decode_salt(hex: &str) -> Result<[u8; 16], String> {
    if hex.len() != 32 {
        return Err(format!("salt must be 32 hex characters (16 bytes), got {}", hex.len()));
    }
    let mut salt = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk).map_err(|_| "salt is not valid hex".to_string())?;
        salt[i] = u8::from_str_radix(byte_str, 16).map_err(|_| "salt is not valid hex".to_string())?;
    }
    Ok(salt)
}

pub fn encode_salt(salt: &[u8; 16]) -> String {
    salt.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_round_trips_through_hex() {
        let salt = [0xabu8; 16];
        let hex = encode_salt(&salt);
        assert_eq!(decode_salt(&hex).unwrap(), salt);
    }

    #[test]
    fn decode_salt_rejects_wrong_length() {
        assert!(decode_salt("abcd").is_err());
    }
}
