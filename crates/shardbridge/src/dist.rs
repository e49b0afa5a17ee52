//! Rank-scoped distributed tensors.
//!
//! A [`DistTensor`] declares the global size of a tensor and holds the local
//! shards this rank owns, each with its own offsets and sizes along every
//! axis. This is the representation the training framework hands to the
//! checkpoint path and expects back after loading.

use std::fmt;
use std::ops::Range;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use shardbridge_core::{Result, ShardBridgeError};

/// Rank and device that own a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub rank: usize,
    pub device: String,
}

impl Placement {
    pub fn new(rank: usize, device: impl Into<String>) -> Self {
        Self {
            rank,
            device: device.into(),
        }
    }

    pub fn cpu(rank: usize) -> Self {
        Self::new(rank, "cpu")
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank:{}/{}", self.rank, self.device)
    }
}

/// Where one local shard sits in the global tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub shard_offsets: Vec<usize>,
    pub shard_sizes: Vec<usize>,
    pub placement: Placement,
}

impl ShardMetadata {
    /// Global index ranges covered by the shard, one per axis.
    pub fn region(&self) -> Vec<Range<usize>> {
        self.shard_offsets
            .iter()
            .zip(&self.shard_sizes)
            .map(|(&offset, &size)| offset..offset + size)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct LocalShard {
    pub tensor: Tensor,
    pub metadata: ShardMetadata,
}

impl LocalShard {
    /// Wrap a tensor placed at `offsets`; sizes are taken from the tensor.
    pub fn from_tensor_and_offsets(tensor: Tensor, offsets: Vec<usize>, placement: Placement) -> Self {
        let metadata = ShardMetadata {
            shard_sizes: tensor.dims().to_vec(),
            shard_offsets: offsets,
            placement,
        };
        Self { tensor, metadata }
    }
}

/// A globally sized tensor of which this rank holds `local_shards`.
#[derive(Debug, Clone)]
pub struct DistTensor {
    size: Vec<usize>,
    local_shards: Vec<LocalShard>,
}

impl DistTensor {
    pub fn new(size: Vec<usize>, local_shards: Vec<LocalShard>) -> Self {
        Self { size, local_shards }
    }

    /// Declared global size.
    pub fn size(&self) -> &[usize] {
        &self.size
    }

    pub fn local_shards(&self) -> &[LocalShard] {
        &self.local_shards
    }

    pub fn into_local_shards(self) -> Vec<LocalShard> {
        self.local_shards
    }

    /// Placement shared by all local shards, `None` when the rank holds none.
    pub fn placement(&self) -> Option<&Placement> {
        self.local_shards.first().map(|s| &s.metadata.placement)
    }

    /// Check every local shard against the declared size and against each
    /// other's placement.
    pub fn validate(&self, key: &str) -> Result<()> {
        let ndim = self.size.len();
        for (i, shard) in self.local_shards.iter().enumerate() {
            let meta = &shard.metadata;
            if meta.shard_offsets.len() != ndim || meta.shard_sizes.len() != ndim {
                return Err(ShardBridgeError::shape(
                    key,
                    format!(
                        "local shard {i} has {} offsets and {} sizes for a {ndim}-d tensor",
                        meta.shard_offsets.len(),
                        meta.shard_sizes.len()
                    ),
                ));
            }
            if shard.tensor.dims() != meta.shard_sizes.as_slice() {
                return Err(ShardBridgeError::shape(
                    key,
                    format!(
                        "local shard {i} tensor shape {:?} does not match shard sizes {:?}",
                        shard.tensor.dims(),
                        meta.shard_sizes
                    ),
                ));
            }
            for axis in 0..ndim {
                let end = meta.shard_offsets[axis] + meta.shard_sizes[axis];
                if end > self.size[axis] {
                    return Err(ShardBridgeError::shape(
                        key,
                        format!(
                            "local shard {i} ends at {end} on axis {axis}, beyond global extent {}",
                            self.size[axis]
                        ),
                    ));
                }
            }
        }

        if let Some(first) = self.placement() {
            if let Some(other) = self
                .local_shards
                .iter()
                .map(|s| &s.metadata.placement)
                .find(|p| *p != first)
            {
                return Err(ShardBridgeError::InconsistentPlacement {
                    key: key.to_string(),
                    reason: format!("local shards placed on both {first} and {other}"),
                });
            }
        }
        Ok(())
    }
}
