//! Checkpoint path helpers.

use std::path::{Path, PathBuf};

use shardbridge_core::BridgeConfig;

/// Directory that holds the distributed checkpoint for `path`.
///
/// Trainer-style checkpoint files end in `.ckpt`; the distributed
/// checkpoint lives in a directory of the same name without the extension.
/// Any other path is already a directory and is returned unchanged.
pub fn checkpoint_dir<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if path.extension().is_some_and(|ext| ext == "ckpt") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// Distributed checkpoint directory named by `config.checkpoint_dir`.
pub fn configured_checkpoint_dir(config: &BridgeConfig) -> PathBuf {
    checkpoint_dir(&config.checkpoint_dir)
}
