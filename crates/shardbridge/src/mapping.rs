//! Model-parallel shard descriptors.
//!
//! A [`ShardedTensor`] places one local tensor inside a globally distributed
//! tensor: global shape, per-axis global offset and per-axis fragmentation.
//! Leading "prepend" axes are synthetic stacking axes (e.g. the layer index)
//! with a local extent of 1. A [`ShardedObject`] carries an opaque payload
//! with the same kind of placement but no tensor geometry.

use std::fmt;
use std::ops::Range;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use shardbridge_core::{Result, ShardBridgeError};

/// Placement of a shard along one axis: `(axis, rank_offset, fragmentation)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisOffset {
    pub axis: usize,
    pub rank_offset: usize,
    pub fragmentation: usize,
}

impl AxisOffset {
    pub fn new(axis: usize, rank_offset: usize, fragmentation: usize) -> Self {
        Self {
            axis,
            rank_offset,
            fragmentation,
        }
    }
}

impl From<(usize, usize, usize)> for AxisOffset {
    fn from((axis, rank_offset, fragmentation): (usize, usize, usize)) -> Self {
        Self::new(axis, rank_offset, fragmentation)
    }
}

/// Distinguishes duplicate copies of the same shard held by several ranks.
///
/// All-zero ids mark the main replica, the one that gets written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId(Vec<usize>);

impl ReplicaId {
    pub fn new(parts: Vec<usize>) -> Self {
        Self(parts)
    }

    /// The single-component main replica `[0]`.
    pub fn primary() -> Self {
        Self(vec![0])
    }

    pub fn parts(&self) -> &[usize] {
        &self.0
    }

    pub fn is_main_replica(&self) -> bool {
        self.0.iter().all(|&p| p == 0)
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::primary()
    }
}

/// One rank-local tensor shard and its place in the global tensor.
#[derive(Debug, Clone)]
pub struct ShardedTensor {
    /// Checkpoint key shared by every shard of the logical tensor.
    pub key: String,
    /// Local buffer. `None` for metadata-only template entries.
    pub data: Option<Tensor>,
    pub dtype: DType,
    /// Shape of the local buffer (excludes prepend axes).
    pub local_shape: Vec<usize>,
    pub global_shape: Vec<usize>,
    pub global_offset: Vec<usize>,
    /// Number of shards each axis is divided into.
    pub axis_fragmentations: Vec<usize>,
    pub replica_id: ReplicaId,
    /// Number of synthetic leading axes.
    pub prepend_axis_num: usize,
    /// Skip the `global == local * fragmentation` check (vocabulary tables).
    pub allow_shape_mismatch: bool,
}

impl ShardedTensor {
    /// Build a descriptor from per-axis rank offsets.
    ///
    /// Axes not named in `rank_offsets` are unsharded. Axis indices count the
    /// prepend axes first, so `axis < prepend_axis_num` addresses a synthetic
    /// axis of local extent 1.
    pub fn from_rank_offsets(
        key: impl Into<String>,
        data: Tensor,
        rank_offsets: &[AxisOffset],
        replica_id: ReplicaId,
        prepend_axis_num: usize,
        allow_shape_mismatch: bool,
    ) -> Result<Self> {
        let key = key.into();
        let local_shape = data.dims().to_vec();
        let ndim = local_shape.len() + prepend_axis_num;

        let mut global_shape: Vec<usize> = std::iter::repeat_n(1, prepend_axis_num)
            .chain(local_shape.iter().copied())
            .collect();
        let mut global_offset = vec![0; ndim];
        let mut axis_fragmentations = vec![1; ndim];
        let mut seen = vec![false; ndim];

        for offset in rank_offsets {
            let AxisOffset {
                axis,
                rank_offset,
                fragmentation,
            } = *offset;
            if axis >= ndim {
                return Err(ShardBridgeError::shape(
                    &key,
                    format!("axis {axis} out of range for {ndim} axes"),
                ));
            }
            if rank_offset >= fragmentation {
                return Err(ShardBridgeError::shape(
                    &key,
                    format!(
                        "rank offset {rank_offset} must be lower than fragmentation {fragmentation} on axis {axis}"
                    ),
                ));
            }
            if seen[axis] {
                return Err(ShardBridgeError::shape(
                    &key,
                    format!("duplicated axis {axis}"),
                ));
            }
            seen[axis] = true;

            let local_extent = if axis < prepend_axis_num {
                1
            } else {
                local_shape[axis - prepend_axis_num]
            };
            global_shape[axis] = fragmentation * local_extent;
            global_offset[axis] = rank_offset * local_extent;
            axis_fragmentations[axis] = fragmentation;
        }

        let sharded = Self {
            key,
            dtype: data.dtype(),
            data: Some(data),
            local_shape,
            global_shape,
            global_offset,
            axis_fragmentations,
            replica_id,
            prepend_axis_num,
            allow_shape_mismatch,
        };
        sharded.validate_metadata()?;
        Ok(sharded)
    }

    /// Drop the local buffer, keeping only the placement.
    pub fn without_data(mut self) -> Self {
        self.data = None;
        self
    }

    /// Check that shape, offsets and fragmentation agree.
    ///
    /// For every non-prepend axis the global offset must be a multiple of the
    /// local extent that falls inside the fragmentation, and unless
    /// `allow_shape_mismatch` is set the global extent must equal
    /// `local extent * fragmentation`.
    pub fn validate_metadata(&self) -> Result<()> {
        let key = &self.key;
        let ndim = self.global_shape.len();
        if self.global_offset.len() != ndim || self.axis_fragmentations.len() != ndim {
            return Err(ShardBridgeError::shape(
                key,
                format!(
                    "global_shape has {ndim} axes, global_offset {}, axis_fragmentations {}",
                    self.global_offset.len(),
                    self.axis_fragmentations.len()
                ),
            ));
        }
        if self.local_shape.len() + self.prepend_axis_num != ndim {
            return Err(ShardBridgeError::shape(
                key,
                format!(
                    "local shape {:?} with {} prepend axes does not match global shape {:?}",
                    self.local_shape, self.prepend_axis_num, self.global_shape
                ),
            ));
        }
        if let Some(data) = &self.data {
            if data.dims() != self.local_shape.as_slice() {
                return Err(ShardBridgeError::shape(
                    key,
                    format!(
                        "buffer shape {:?} does not match local shape {:?}",
                        data.dims(),
                        self.local_shape
                    ),
                ));
            }
            if data.dtype() != self.dtype {
                return Err(ShardBridgeError::shape(
                    key,
                    format!(
                        "buffer dtype {:?} does not match {:?}",
                        data.dtype(),
                        self.dtype
                    ),
                ));
            }
        }

        for axis in 0..ndim {
            let local = self.local_extent(axis);
            let global = self.global_shape[axis];
            let offset = self.global_offset[axis];
            let fragmentation = self.axis_fragmentations[axis];

            if local == 0 || fragmentation == 0 {
                return Err(ShardBridgeError::shape(
                    key,
                    format!("axis {axis} has zero local extent or fragmentation"),
                ));
            }
            if offset % local != 0 {
                return Err(ShardBridgeError::shape(
                    key,
                    format!(
                        "global offset ({offset}) must be divisible by local extent ({local}) on axis {axis}"
                    ),
                ));
            }
            if offset / local >= fragmentation {
                return Err(ShardBridgeError::shape(
                    key,
                    format!(
                        "global offset ({offset}) is outside fragmentation {fragmentation} x {local} on axis {axis}"
                    ),
                ));
            }
            if !self.allow_shape_mismatch && global != local * fragmentation {
                return Err(ShardBridgeError::shape(
                    key,
                    format!(
                        "global extent {global} != local extent {local} x fragmentation {fragmentation} on axis {axis}"
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Remove the prepend axes from the global metadata.
    pub fn strip_prepend_axes(&mut self) {
        let n = self.prepend_axis_num;
        self.global_shape.drain(..n);
        self.global_offset.drain(..n);
        self.axis_fragmentations.drain(..n);
        self.prepend_axis_num = 0;
    }

    /// Extent of this shard along `axis` (1 on prepend axes).
    pub fn local_extent(&self, axis: usize) -> usize {
        if axis < self.prepend_axis_num {
            1
        } else {
            self.local_shape[axis - self.prepend_axis_num]
        }
    }

    /// Global index ranges covered by this shard, one per axis.
    pub fn global_region(&self) -> Vec<Range<usize>> {
        self.global_offset
            .iter()
            .enumerate()
            .map(|(axis, &offset)| offset..offset + self.local_extent(axis))
            .collect()
    }
}

impl fmt::Display for ShardedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ShardedTensor({} local={:?} global={:?} offset={:?} fragm={:?})",
            self.key, self.local_shape, self.global_shape, self.global_offset, self.axis_fragmentations
        )
    }
}

/// Opaque checkpoint payload placed in a (possibly stacked) global grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedObject {
    pub key: String,
    pub data: Vec<u8>,
    pub global_shape: Vec<usize>,
    pub global_offset: Vec<usize>,
    pub replica_id: ReplicaId,
}

impl ShardedObject {
    /// Key that is unique per grid cell, used as the storage name.
    pub fn unique_key(&self) -> String {
        let join = |v: &[usize]| {
            v.iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(".")
        };
        format!(
            "{}/shard_{}_{}",
            self.key,
            join(&self.global_offset),
            join(&self.global_shape)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_from_rank_offsets_geometry() {
        let sh = ShardedTensor::from_rank_offsets(
            "decoder.mlp.weight",
            zeros(&[4, 6]),
            &[AxisOffset::new(0, 2, 5), AxisOffset::new(2, 1, 2)],
            ReplicaId::primary(),
            1,
            false,
        )
        .unwrap();

        assert_eq!(sh.global_shape, vec![5, 4, 12]);
        assert_eq!(sh.global_offset, vec![2, 0, 6]);
        assert_eq!(sh.axis_fragmentations, vec![5, 1, 2]);
        assert_eq!(sh.global_region(), vec![2..3, 0..4, 6..12]);
    }

    #[test]
    fn test_tensor_axis_offsets_scale_by_local_extent() {
        let sh = ShardedTensor::from_rank_offsets(
            "w",
            zeros(&[3, 4]),
            &[AxisOffset::new(1, 1, 2)],
            ReplicaId::primary(),
            0,
            false,
        )
        .unwrap();
        assert_eq!(sh.global_shape, vec![3, 8]);
        assert_eq!(sh.global_offset, vec![0, 4]);
    }

    #[test]
    fn test_duplicated_axis_rejected() {
        let err = ShardedTensor::from_rank_offsets(
            "w",
            zeros(&[2, 2]),
            &[AxisOffset::new(0, 0, 2), AxisOffset::new(0, 1, 2)],
            ReplicaId::primary(),
            0,
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicated axis"));
    }

    #[test]
    fn test_rank_offset_must_be_below_fragmentation() {
        let err = ShardedTensor::from_rank_offsets(
            "w",
            zeros(&[2]),
            &[AxisOffset::new(0, 2, 2)],
            ReplicaId::primary(),
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ShardBridgeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_validate_rejects_misaligned_offset() {
        let mut sh = ShardedTensor::from_rank_offsets(
            "w",
            zeros(&[4]),
            &[AxisOffset::new(0, 1, 2)],
            ReplicaId::primary(),
            0,
            false,
        )
        .unwrap();
        sh.global_offset[0] = 3;
        assert!(sh.validate_metadata().is_err());
    }

    #[test]
    fn test_allow_shape_mismatch_skips_global_extent_check() {
        let mut sh = ShardedTensor::from_rank_offsets(
            "embedding.word_embeddings.weight",
            zeros(&[4, 2]),
            &[AxisOffset::new(0, 0, 2)],
            ReplicaId::primary(),
            0,
            true,
        )
        .unwrap();
        sh.global_shape[0] = 9;
        sh.validate_metadata().unwrap();

        sh.allow_shape_mismatch = false;
        assert!(sh.validate_metadata().is_err());
    }

    #[test]
    fn test_buffer_shape_and_dtype_checked() {
        let mut sh = ShardedTensor::from_rank_offsets(
            "w",
            zeros(&[2, 2]),
            &[],
            ReplicaId::primary(),
            0,
            false,
        )
        .unwrap();
        sh.data = Some(zeros(&[2, 3]));
        assert!(sh.validate_metadata().is_err());

        sh.data = Some(Tensor::zeros((2, 2), DType::F16, &Device::Cpu).unwrap());
        let err = sh.validate_metadata().unwrap_err();
        assert!(err.to_string().contains("dtype"));

        let sh = sh.without_data();
        sh.validate_metadata().unwrap();
    }

    #[test]
    fn test_strip_prepend_axes() {
        let mut sh = ShardedTensor::from_rank_offsets(
            "w",
            zeros(&[2, 3]),
            &[AxisOffset::new(0, 1, 4), AxisOffset::new(1, 2, 3)],
            ReplicaId::primary(),
            1,
            false,
        )
        .unwrap();
        sh.strip_prepend_axes();
        assert_eq!(sh.prepend_axis_num, 0);
        assert_eq!(sh.global_shape, vec![6, 3]);
        assert_eq!(sh.global_offset, vec![4, 0]);
        assert_eq!(sh.axis_fragmentations, vec![3, 1]);
        sh.validate_metadata().unwrap();
    }

    #[test]
    fn test_replica_id() {
        assert!(ReplicaId::primary().is_main_replica());
        assert!(ReplicaId::new(vec![0, 0, 0]).is_main_replica());
        assert!(!ReplicaId::new(vec![0, 0, 3]).is_main_replica());
    }

    #[test]
    fn test_object_unique_key() {
        let obj = ShardedObject {
            key: "decoder.layers.self_attention._extra_state".into(),
            data: vec![1, 2, 3],
            global_shape: vec![4],
            global_offset: vec![2],
            replica_id: ReplicaId::new(vec![0, 0, 1]),
        };
        assert_eq!(
            obj.unique_key(),
            "decoder.layers.self_attention._extra_state/shard_2_4"
        );
    }
}
