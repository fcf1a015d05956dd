//! `tfhfs` — mounts an encrypted, content-addressed B+tree filesystem
//! at `MOUNTDIR`, backed by `STOREDIR` (only the in-memory backend is
//! wired up today; see `DESIGN.md`).

mod cli;

use std::process::ExitCode;

use clap::Parser;
use fuser::MountOption;
use log::{error, info};

use tfhfs_block::InMemoryBlockBackend;
use tfhfs_crypto::AesGcmEnvelope;
use tfhfs_fs::{Dispatcher, Fs};

use cli::Args;

/// Storage-layer cache ceiling in bytes. No CLI knob for this yet —
/// the original ties it to available memory detection this crate
/// doesn't replicate.
const CACHE_CEILING: usize = 64 * 1024 * 1024;

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();

    if args.backend != "memory" {
        error!("unsupported backend {:?}; only \"memory\" is implemented", args.backend);
        return ExitCode::from(2);
    }

    let salt = match &args.salt {
        Some(hex) => match cli::decode_salt(hex) {
            Ok(salt) => salt,
            Err(e) => {
                error!("{e}");
                return ExitCode::from(2);
            }
        },
        None => {
            let salt = AesGcmEnvelope::generate_salt();
            info!("generated a fresh salt, pass --salt {} to reopen this store", cli::encode_salt(&salt));
            salt
        }
    };

    info!("mounting {} (store {})", args.mountdir.display(), args.storedir.display());

    let envelope = Box::new(AesGcmEnvelope::new(args.password.as_bytes(), &salt));
    let backend = Box::new(InMemoryBlockBackend::new());
    let storage = tfhfs_storage::spawn(backend, envelope, CACHE_CEILING);

    let fs = match Fs::new(storage) {
        Ok(fs) => fs,
        Err(e) => {
            error!("failed to open filesystem: {e}");
            return ExitCode::from(2);
        }
    };

    let options = vec![
        MountOption::FSName("tfhfs".to_string()),
        MountOption::DefaultPermissions,
    ];

    if let Err(e) = fuser::mount2(Dispatcher::new(fs), &args.mountdir, &options) {
        error!("mount failed: {e}");
        return ExitCode::from(2);
    }

    ExitCode::SUCCESS
}
