//! Structured logging for checkpoint conversion with tracing.
//!
//! Conversion itself only emits events; binaries and tests pick a subscriber
//! with [`init_logging`], [`init_console_logging`] or [`init_from_config`].

use shardbridge_core::BridgeConfig;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter from `RUST_LOG`, falling back to `default_level`.
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to
/// `default_level`). Outputs JSON-formatted logs for production monitoring.
pub fn init_logging(default_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(default_level = default_level, "Structured logging initialized");
}

/// Initialize simple console logging (for debugging).
pub fn init_console_logging(default_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// Structured logging at the level configured in `config`.
pub fn init_from_config(config: &BridgeConfig) {
    init_logging(&config.log_level);
}

/// Counts gathered while walking a state dict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Tensor leaves translated.
    pub tensors: usize,
    /// Local shards across those tensors.
    pub shards: usize,
    /// Opaque objects wrapped or passed through.
    pub objects: usize,
    /// Leaves left untouched.
    pub passthrough: usize,
}

/// Log the result of merging a loaded checkpoint into distributed tensors.
pub fn log_merge_summary(summary: &WalkSummary) {
    info!(
        tensors = summary.tensors,
        shards = summary.shards,
        objects = summary.objects,
        passthrough = summary.passthrough,
        event = "checkpoint_merged",
        "Loaded checkpoint merged into distributed tensors"
    );
}

/// Log the result of splitting a state dict for saving.
pub fn log_split_summary(summary: &WalkSummary, num_layers: usize) {
    info!(
        tensors = summary.tensors,
        shards = summary.shards,
        objects = summary.objects,
        passthrough = summary.passthrough,
        num_layers = num_layers,
        event = "checkpoint_split",
        "State dict split into sharded descriptors"
    );
}

/// Log a fragmentation that had to be truncated because the global extent
/// is not a multiple of the shard extent.
pub fn log_fragmentation_truncated(key: &str, axis: usize, global: usize, local: usize) {
    warn!(
        key = key,
        axis = axis,
        global_extent = global,
        local_extent = local,
        fragmentation = global / local,
        event = "fragmentation_truncated",
        "Global extent is not a multiple of the shard extent; fragmentation truncated"
    );
}

/// Log a leaf the walker left as it was.
pub fn log_passthrough(key: &str, kind: &str) {
    debug!(key = key, kind = kind, "Leaf passed through unchanged");
}
