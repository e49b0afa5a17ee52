//! Nested checkpoint state dicts.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::dist::DistTensor;
use crate::mapping::{ShardedObject, ShardedTensor};

/// Mapping from key segments to values; nested dicts form dotted paths.
pub type StateDict = BTreeMap<String, StateValue>;

/// A node of a [`StateDict`].
///
/// Which leaf kinds appear depends on the stage: the training framework
/// produces `Dist` and `Bytes`, saving turns them into `Sharded` and
/// `Object`, and loading yields `Buffers` that are merged back into `Dist`.
#[derive(Debug, Clone)]
pub enum StateValue {
    Dict(StateDict),
    /// Loaded local buffers, one per model chunk.
    Buffers(Vec<Tensor>),
    Dist(DistTensor),
    /// Serialized non-tensor state.
    Bytes(Vec<u8>),
    Sharded(Vec<ShardedTensor>),
    Object(ShardedObject),
}

impl StateValue {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Dict(_) => "dict",
            StateValue::Buffers(_) => "tensor buffers",
            StateValue::Dist(_) => "distributed tensor",
            StateValue::Bytes(_) => "bytes",
            StateValue::Sharded(_) => "sharded tensors",
            StateValue::Object(_) => "sharded object",
        }
    }

    pub fn as_dict(&self) -> Option<&StateDict> {
        match self {
            StateValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dist(&self) -> Option<&DistTensor> {
        match self {
            StateValue::Dist(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_sharded(&self) -> Option<&[ShardedTensor]> {
        match self {
            StateValue::Sharded(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ShardedObject> {
        match self {
            StateValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StateValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<StateDict> for StateValue {
    fn from(d: StateDict) -> Self {
        StateValue::Dict(d)
    }
}

impl From<Vec<Tensor>> for StateValue {
    fn from(buffers: Vec<Tensor>) -> Self {
        StateValue::Buffers(buffers)
    }
}

impl From<DistTensor> for StateValue {
    fn from(t: DistTensor) -> Self {
        StateValue::Dist(t)
    }
}

impl From<Vec<u8>> for StateValue {
    fn from(b: Vec<u8>) -> Self {
        StateValue::Bytes(b)
    }
}

impl From<Vec<ShardedTensor>> for StateValue {
    fn from(s: Vec<ShardedTensor>) -> Self {
        StateValue::Sharded(s)
    }
}

impl From<ShardedObject> for StateValue {
    fn from(o: ShardedObject) -> Self {
        StateValue::Object(o)
    }
}

/// Dotted paths of every leaf, depth first in key order.
pub fn leaf_paths(dict: &StateDict) -> Vec<String> {
    fn walk(dict: &StateDict, prefix: &str, out: &mut Vec<String>) {
        for (key, value) in dict {
            let path = join_key(prefix, key);
            match value {
                StateValue::Dict(sub) => walk(sub, &path, out),
                _ => out.push(path),
            }
        }
    }
    let mut out = Vec::new();
    walk(dict, "", &mut out);
    out
}

/// Dot-join two key segments, skipping an empty prefix.
pub(crate) fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
