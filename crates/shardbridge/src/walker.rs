//! State-dict conversion in both checkpoint directions.
//!
//! Both walks take ownership of the caller's dict and hand back the
//! converted one; the input is not preserved.

use shardbridge_core::{ConversionConfig, Result, ShardBridgeError};
use tracing::debug;

use crate::dist::Placement;
use crate::layers::{parse_layer_key, resolve_num_layers};
use crate::logging::{log_merge_summary, log_passthrough, log_split_summary, WalkSummary};
use crate::mapping::{AxisOffset, ReplicaId};
use crate::parallel::ParallelState;
use crate::state_dict::{join_key, StateDict, StateValue};
use crate::translate::{to_dist_tensor, to_sharded_object, to_sharded_tensors};

/// Converts state dicts between the training framework and the
/// checkpoint library, using the rank layout of `parallel`.
#[derive(Debug, Clone)]
pub struct StateDictConverter<P> {
    config: ConversionConfig,
    parallel: P,
}

impl<P: ParallelState> StateDictConverter<P> {
    /// Converter with the default key conventions.
    pub fn new(parallel: P) -> Self {
        Self {
            config: ConversionConfig::default(),
            parallel,
        }
    }

    pub fn with_config(config: ConversionConfig, parallel: P) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, parallel })
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn parallel(&self) -> &P {
        &self.parallel
    }

    /// Replace loaded buffers with distributed tensors, driven by `template`.
    ///
    /// Every key of the template must exist in `checkpoint`. Template
    /// sub-dicts recurse, sharded objects leave the loaded payload as it is,
    /// and descriptor lists turn the loaded buffers at the same key into a
    /// [`crate::dist::DistTensor`]. Checkpoint keys the template does not
    /// mention pass through.
    pub fn merge_loaded(&self, mut checkpoint: StateDict, template: StateDict) -> Result<StateDict> {
        let placement = self.parallel.placement();
        let mut summary = WalkSummary::default();
        merge_into(&mut checkpoint, template, "", &placement, &mut summary)?;
        log_merge_summary(&summary);
        Ok(checkpoint)
    }

    /// Turn distributed tensors and opaque payloads into sharded descriptors.
    ///
    /// Top-level keys in the layer stack lose their layer index, which
    /// becomes a leading axis fragmented over the total layer count.
    /// Vocabulary tables (keys ending with the configured suffix) may have a
    /// global extent that is not a multiple of their shard extent.
    pub fn split_for_save(&self, state: StateDict, prefix: &str) -> Result<StateDict> {
        let layer_prefix = &self.config.layer_prefix;
        let mut num_layers = resolve_num_layers(state.keys().map(String::as_str), layer_prefix)?;
        if let Some(total) = self.config.num_layers {
            if num_layers > total {
                return Err(ShardBridgeError::MalformedLayerStack(format!(
                    "layer index {} exceeds configured num_layers {total}",
                    num_layers - 1
                )));
            }
            num_layers = total;
        }
        if num_layers == 0 && self.config.require_layer_stack {
            return Err(ShardBridgeError::MalformedLayerStack(format!(
                "no key starts with '{layer_prefix}'"
            )));
        }

        let replica_id = ReplicaId::new(vec![0, 0, self.parallel.data_parallel_rank(true)]);
        let mut summary = WalkSummary::default();
        let mut split = StateDict::new();
        for (key, value) in state {
            let mut prepend_offsets = Vec::new();
            let stacked_key = match parse_layer_key(&key, layer_prefix)? {
                Some(layer) => {
                    prepend_offsets.push(AxisOffset::new(0, layer.index, num_layers));
                    layer.stacked
                }
                None => key.clone(),
            };
            let leaf = SplitLeaf {
                prepend_offsets: &prepend_offsets,
                allow_shape_mismatch: stacked_key.ends_with(&self.config.vocab_suffix),
                replica_id: &replica_id,
            };
            let value = split_value(value, &format!("{prefix}{stacked_key}"), &leaf, &mut summary)?;
            split.insert(key, value);
        }

        log_split_summary(&summary, num_layers);
        Ok(split)
    }
}

fn merge_into(
    checkpoint: &mut StateDict,
    template: StateDict,
    path: &str,
    placement: &Placement,
    summary: &mut WalkSummary,
) -> Result<()> {
    for (key, expected) in template {
        let full_key = join_key(path, &key);
        let Some(slot) = checkpoint.get_mut(&key) else {
            return Err(ShardBridgeError::MissingKey { key: full_key });
        };

        match expected {
            StateValue::Dict(sub_template) => match slot {
                StateValue::Dict(sub) => merge_into(sub, sub_template, &full_key, placement, summary)?,
                other => return Err(unexpected(full_key, "dict", other)),
            },
            StateValue::Object(_) => {
                // The loaded payload is already the final value.
                summary.objects += 1;
            }
            StateValue::Sharded(descriptors) => {
                let buffers = match &mut *slot {
                    StateValue::Buffers(buffers) => std::mem::take(buffers),
                    other => return Err(unexpected(full_key, "tensor buffers", other)),
                };
                let dist = to_dist_tensor(buffers, descriptors, placement)
                    .map_err(|err| with_path(err, &full_key))?;
                summary.tensors += 1;
                summary.shards += dist.local_shards().len();
                *slot = StateValue::Dist(dist);
            }
            other => {
                log_passthrough(&full_key, other.kind());
                summary.passthrough += 1;
            }
        }
    }
    Ok(())
}

/// Per-top-level-key settings shared by every leaf below it.
struct SplitLeaf<'a> {
    prepend_offsets: &'a [AxisOffset],
    allow_shape_mismatch: bool,
    replica_id: &'a ReplicaId,
}

fn split_value(
    value: StateValue,
    sh_key: &str,
    leaf: &SplitLeaf<'_>,
    summary: &mut WalkSummary,
) -> Result<StateValue> {
    match value {
        StateValue::Dict(dict) => {
            let mut split = StateDict::new();
            for (key, value) in dict {
                let value = split_value(value, &join_key(sh_key, &key), leaf, summary)?;
                split.insert(key, value);
            }
            Ok(StateValue::Dict(split))
        }
        StateValue::Dist(tensor) => {
            let sharded = to_sharded_tensors(
                sh_key,
                tensor,
                leaf.prepend_offsets,
                leaf.allow_shape_mismatch,
            )?;
            summary.tensors += 1;
            summary.shards += sharded.len();
            Ok(StateValue::Sharded(sharded))
        }
        StateValue::Bytes(data) => {
            debug!(key = sh_key, bytes = data.len(), "Wrapping opaque object");
            let object = to_sharded_object(
                sh_key,
                data,
                leaf.prepend_offsets,
                leaf.replica_id.clone(),
            )?;
            summary.objects += 1;
            Ok(StateValue::Object(object))
        }
        other => {
            log_passthrough(sh_key, other.kind());
            summary.passthrough += 1;
            Ok(other)
        }
    }
}

/// Name the state-dict path in errors raised before any descriptor key was
/// known (an empty descriptor list).
fn with_path(err: ShardBridgeError, path: &str) -> ShardBridgeError {
    match err {
        ShardBridgeError::ArityMismatch {
            key,
            buffers,
            descriptors,
        } if key.is_empty() => ShardBridgeError::ArityMismatch {
            key: path.to_string(),
            buffers,
            descriptors,
        },
        ShardBridgeError::ShapeMismatch { key, reason } if key.is_empty() => {
            ShardBridgeError::shape(path, reason)
        }
        other => other,
    }
}

fn unexpected(key: String, expected: &'static str, found: &StateValue) -> ShardBridgeError {
    ShardBridgeError::UnexpectedValue {
        key,
        expected,
        found: found.kind(),
    }
}
