//! Layer-stack key handling.
//!
//! Per-layer parameters are saved under keys such as
//! `module.decoder.layers.3.mlp.weight`. The segment after the layer prefix
//! is the layer index; stripping it yields the stacked key shared by every
//! layer, and the index becomes a synthetic leading axis.

use shardbridge_core::{Result, ShardBridgeError};

/// A layer-stacked key split into its layer index and stacked key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerKey {
    pub index: usize,
    pub stacked: String,
}

/// Parse `key` against `layer_prefix`.
///
/// Returns `Ok(None)` for keys outside the layer stack.
pub fn parse_layer_key(key: &str, layer_prefix: &str) -> Result<Option<LayerKey>> {
    let Some(rest) = key.strip_prefix(layer_prefix) else {
        return Ok(None);
    };
    let (index, tail) = match rest.split_once('.') {
        Some((index, tail)) => (index, Some(tail)),
        None => (rest, None),
    };
    let index = index.parse::<usize>().map_err(|_| {
        ShardBridgeError::MalformedLayerStack(format!(
            "layer index '{index}' in '{key}' is not an integer"
        ))
    })?;
    let stacked = match tail {
        Some(tail) => format!("{layer_prefix}{tail}"),
        None => layer_prefix.trim_end_matches('.').to_string(),
    };
    Ok(Some(LayerKey { index, stacked }))
}

/// Total number of layers: `max(index) + 1` over keys in the layer stack,
/// 0 when none is.
pub fn resolve_num_layers<'a, I>(keys: I, layer_prefix: &str) -> Result<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut num_layers = 0;
    for key in keys {
        if let Some(layer) = parse_layer_key(key, layer_prefix)? {
            let count = layer.index.checked_add(1).ok_or_else(|| {
                ShardBridgeError::MalformedLayerStack(format!("layer index in '{key}' is out of range"))
            })?;
            num_layers = num_layers.max(count);
        }
    }
    Ok(num_layers)
}
