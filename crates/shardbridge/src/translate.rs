//! Geometry translation between shard descriptors and distributed tensors.
//!
//! Loading goes descriptor -> [`DistTensor`] ([`to_dist_tensor`]), saving goes
//! [`DistTensor`] -> descriptors ([`to_sharded_tensors`]). Opaque payloads are
//! wrapped with [`to_sharded_object`] and never checked against tensor
//! geometry.

use candle_core::Tensor;
use shardbridge_core::{Result, ShardBridgeError};
use tracing::debug;

use crate::dist::{DistTensor, LocalShard, Placement};
use crate::logging::log_fragmentation_truncated;
use crate::mapping::{AxisOffset, ReplicaId, ShardedObject, ShardedTensor};

/// Aggregate loaded buffers into one distributed tensor.
///
/// `buffers[i]` is attached to `descriptors[i]` (one pair per model chunk).
/// Prepend axes are stripped from each descriptor before it is validated
/// against its buffer. The descriptors are consumed.
pub fn to_dist_tensor(
    buffers: Vec<Tensor>,
    descriptors: Vec<ShardedTensor>,
    placement: &Placement,
) -> Result<DistTensor> {
    let key = descriptors
        .first()
        .map(|d| d.key.clone())
        .unwrap_or_default();
    if buffers.len() != descriptors.len() {
        return Err(ShardBridgeError::ArityMismatch {
            key,
            buffers: buffers.len(),
            descriptors: descriptors.len(),
        });
    }
    if descriptors.is_empty() {
        return Err(ShardBridgeError::shape(key, "no local shards to aggregate"));
    }

    let mut global_shape: Option<Vec<usize>> = None;
    let mut local_shards = Vec::with_capacity(descriptors.len());
    for (buffer, mut sh_ten) in buffers.into_iter().zip(descriptors) {
        sh_ten.strip_prepend_axes();
        sh_ten.data = Some(buffer);
        sh_ten.validate_metadata()?;

        match &global_shape {
            None => global_shape = Some(sh_ten.global_shape.clone()),
            Some(shape) if *shape != sh_ten.global_shape => {
                return Err(ShardBridgeError::shape(
                    &key,
                    format!(
                        "shards disagree on global shape: {:?} vs {:?}",
                        shape, sh_ten.global_shape
                    ),
                ));
            }
            Some(_) => {}
        }

        let ShardedTensor {
            data, global_offset, ..
        } = sh_ten;
        if let Some(tensor) = data {
            local_shards.push(LocalShard::from_tensor_and_offsets(
                tensor,
                global_offset,
                placement.clone(),
            ));
        }
    }

    let dist = DistTensor::new(global_shape.unwrap_or_default(), local_shards);
    dist.validate(&key)?;
    debug!(
        key = %key,
        size = ?dist.size(),
        shards = dist.local_shards().len(),
        "Built distributed tensor"
    );
    Ok(dist)
}

/// Describe every local shard of `tensor` as a [`ShardedTensor`].
///
/// `prepend_offsets` become the leading axes of each descriptor. The
/// fragmentation of each real axis is `global extent / shard extent` of the
/// first local shard; a remainder is an error unless `allow_shape_mismatch`
/// is set, in which case it is truncated and logged. Shard offsets must
/// always sit on a shard boundary.
pub fn to_sharded_tensors(
    key: &str,
    tensor: DistTensor,
    prepend_offsets: &[AxisOffset],
    allow_shape_mismatch: bool,
) -> Result<Vec<ShardedTensor>> {
    tensor.validate(key)?;
    let prepend_axis_num = prepend_offsets.len();
    let global_shape = tensor.size().to_vec();

    let Some(first) = tensor.local_shards().first() else {
        return Ok(Vec::new());
    };
    let axis_fragm = axis_fragmentations(
        key,
        &global_shape,
        &first.metadata.shard_sizes,
        allow_shape_mismatch,
    )?;

    let mut sharded = Vec::with_capacity(tensor.local_shards().len());
    for shard in tensor.into_local_shards() {
        let meta = &shard.metadata;
        let mut rank_offsets = prepend_offsets.to_vec();
        for (axis, (&offset, &size)) in meta.shard_offsets.iter().zip(&meta.shard_sizes).enumerate() {
            if size == 0 {
                return Err(ShardBridgeError::shape(
                    key,
                    format!("local shard has zero extent on axis {axis}"),
                ));
            }
            // Only fragmentation may be truncated; an offset off a shard
            // boundary would move the data.
            if offset % size != 0 {
                return Err(ShardBridgeError::shape(
                    key,
                    format!("shard offset {offset} is not a multiple of shard extent {size} on axis {axis}"),
                ));
            }
            rank_offsets.push(AxisOffset::new(
                axis + prepend_axis_num,
                offset / size,
                axis_fragm[axis],
            ));
        }

        let mut sh_ten = ShardedTensor::from_rank_offsets(
            key,
            shard.tensor,
            &rank_offsets,
            ReplicaId::primary(),
            prepend_axis_num,
            allow_shape_mismatch,
        )?;
        // Keep the declared size so padded vocabularies survive a round trip.
        sh_ten.global_shape[prepend_axis_num..].copy_from_slice(&global_shape);
        sh_ten.validate_metadata()?;
        sharded.push(sh_ten);
    }

    debug!(
        key = key,
        shards = sharded.len(),
        prepend_axis_num = prepend_axis_num,
        "Split distributed tensor"
    );
    Ok(sharded)
}

/// Wrap an opaque payload with the placement implied by `sharded_offsets`.
///
/// The payload is never inspected.
pub fn to_sharded_object(
    key: &str,
    data: Vec<u8>,
    sharded_offsets: &[AxisOffset],
    replica_id: ReplicaId,
) -> Result<ShardedObject> {
    let (global_shape, global_offset) = object_grid(key, sharded_offsets)?;
    Ok(ShardedObject {
        key: key.to_string(),
        data,
        global_shape,
        global_offset,
        replica_id,
    })
}

/// Grid shape and cell of an object stacked along `sharded_offsets`.
///
/// The offsets must name axes `0..n` exactly once; without offsets the
/// object is the single cell of a 1-element grid.
fn object_grid(key: &str, sharded_offsets: &[AxisOffset]) -> Result<(Vec<usize>, Vec<usize>)> {
    if sharded_offsets.is_empty() {
        return Ok((vec![1], vec![0]));
    }
    let mut offsets = sharded_offsets.to_vec();
    offsets.sort_by_key(|o| o.axis);
    if offsets.iter().enumerate().any(|(i, o)| o.axis != i) {
        return Err(ShardBridgeError::shape(
            key,
            format!(
                "object offsets must cover axes 0..{} exactly, got {:?}",
                offsets.len(),
                offsets.iter().map(|o| o.axis).collect::<Vec<_>>()
            ),
        ));
    }
    Ok((
        offsets.iter().map(|o| o.fragmentation).collect(),
        offsets.iter().map(|o| o.rank_offset).collect(),
    ))
}

fn axis_fragmentations(
    key: &str,
    global_shape: &[usize],
    shard_sizes: &[usize],
    allow_shape_mismatch: bool,
) -> Result<Vec<usize>> {
    global_shape
        .iter()
        .zip(shard_sizes)
        .enumerate()
        .map(|(axis, (&global, &local))| {
            if local == 0 {
                return Err(ShardBridgeError::shape(
                    key,
                    format!("local shard has zero extent on axis {axis}"),
                ));
            }
            if global % local != 0 {
                if !allow_shape_mismatch {
                    return Err(ShardBridgeError::shape(
                        key,
                        format!(
                            "global extent {global} is not a multiple of shard extent {local} on axis {axis}"
                        ),
                    ));
                }
                log_fragmentation_truncated(key, axis, global, local);
            }
            Ok(global / local)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    fn rank_tensor(global: Vec<usize>, offsets: Vec<usize>, local: &[usize], rank: usize) -> DistTensor {
        DistTensor::new(
            global,
            vec![LocalShard::from_tensor_and_offsets(zeros(local), offsets, Placement::cpu(rank))],
        )
    }

    #[test]
    fn test_to_sharded_tensors_geometry() {
        let t = rank_tensor(vec![8, 6], vec![4, 0], &[2, 6], 2);
        let sharded = to_sharded_tensors("decoder.weight", t, &[], false).unwrap();
        assert_eq!(sharded.len(), 1);
        let sh = &sharded[0];
        assert_eq!(sh.global_shape, vec![8, 6]);
        assert_eq!(sh.global_offset, vec![4, 0]);
        assert_eq!(sh.axis_fragmentations, vec![4, 1]);
        assert_eq!(sh.prepend_axis_num, 0);
        assert!(sh.replica_id.is_main_replica());
    }

    #[test]
    fn test_prepend_axis_composition() {
        let t = rank_tensor(vec![6, 4], vec![3, 0], &[3, 4], 1);
        let sharded = to_sharded_tensors("layers.mlp.weight", t, &[AxisOffset::new(0, 2, 5)], false).unwrap();
        let sh = &sharded[0];
        assert_eq!(sh.prepend_axis_num, 1);
        assert_eq!(sh.global_shape, vec![5, 6, 4]);
        assert_eq!(sh.global_offset, vec![2, 3, 0]);
        assert_eq!(sh.axis_fragmentations, vec![5, 2, 1]);

        let buffer = sh.data.clone().unwrap();
        let back = to_dist_tensor(vec![buffer], sharded, &Placement::cpu(1)).unwrap();
        assert_eq!(back.size(), &[6, 4]);
        assert_eq!(back.local_shards()[0].metadata.shard_offsets, vec![3, 0]);
        assert_eq!(back.local_shards()[0].metadata.shard_sizes, vec![3, 4]);
    }

    #[test]
    fn test_non_integer_fragmentation_is_error() {
        let t = rank_tensor(vec![10, 4], vec![0, 0], &[4, 4], 0);
        let err = to_sharded_tensors("decoder.weight", t, &[], false).unwrap_err();
        assert!(matches!(err, ShardBridgeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_non_integer_fragmentation_truncated_when_allowed() {
        let t = rank_tensor(vec![10, 4], vec![4, 0], &[4, 4], 1);
        let sharded = to_sharded_tensors("embedding.word_embeddings.weight", t, &[], true).unwrap();
        let sh = &sharded[0];
        assert_eq!(sh.axis_fragmentations, vec![2, 1]);
        assert_eq!(sh.global_shape, vec![10, 4]);
        assert_eq!(sh.global_offset, vec![4, 0]);
    }

    #[test]
    fn test_misaligned_offset_rejected_even_when_allowed() {
        let t = rank_tensor(vec![10], vec![5], &[3], 1);
        let err = to_sharded_tensors("embedding.word_embeddings.weight", t, &[], true).unwrap_err();
        match err {
            ShardBridgeError::ShapeMismatch { key, reason } => {
                assert_eq!(key, "embedding.word_embeddings.weight");
                assert!(reason.contains("not a multiple"));
            }
            other => panic!("Expected shape mismatch, got {other}"),
        }
    }

    #[test]
    fn test_arity_mismatch() {
        let sh = ShardedTensor::from_rank_offsets("w", zeros(&[2]), &[], ReplicaId::primary(), 0, false)
            .unwrap()
            .without_data();
        let err = to_dist_tensor(vec![zeros(&[2]), zeros(&[2])], vec![sh], &Placement::cpu(0)).unwrap_err();
        match err {
            ShardBridgeError::ArityMismatch { key, buffers, descriptors } => {
                assert_eq!(key, "w");
                assert_eq!(buffers, 2);
                assert_eq!(descriptors, 1);
            }
            other => panic!("Expected arity mismatch, got {other}"),
        }
    }

    #[test]
    fn test_buffer_shape_must_match_descriptor() {
        let sh = ShardedTensor::from_rank_offsets(
            "w",
            zeros(&[2, 4]),
            &[AxisOffset::new(0, 1, 2)],
            ReplicaId::primary(),
            0,
            false,
        )
        .unwrap()
        .without_data();
        let err = to_dist_tensor(vec![zeros(&[3, 4])], vec![sh], &Placement::cpu(0)).unwrap_err();
        assert!(matches!(err, ShardBridgeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_model_chunks_aggregate_into_one_tensor() {
        // Two virtual pipeline chunks of the same stacked key on one rank.
        let chunk = |layer: usize| {
            ShardedTensor::from_rank_offsets(
                "decoder.layers.norm.weight",
                zeros(&[8]),
                &[AxisOffset::new(0, layer, 4)],
                ReplicaId::primary(),
                1,
                false,
            )
            .unwrap()
            .without_data()
        };
        let dist = to_dist_tensor(
            vec![zeros(&[8]), zeros(&[8])],
            vec![chunk(0), chunk(2)],
            &Placement::cpu(0),
        )
        .unwrap();
        assert_eq!(dist.size(), &[8]);
        assert_eq!(dist.local_shards().len(), 2);
    }

    #[test]
    fn test_object_grid() {
        let obj = to_sharded_object(
            "decoder.layers.self_attention._extra_state",
            vec![0; 17],
            &[AxisOffset::new(0, 3, 4)],
            ReplicaId::new(vec![0, 0, 5]),
        )
        .unwrap();
        assert_eq!(obj.global_shape, vec![4]);
        assert_eq!(obj.global_offset, vec![3]);
        assert_eq!(obj.replica_id.parts(), &[0, 0, 5]);

        let obj = to_sharded_object("rng_state", vec![1, 2, 3], &[], ReplicaId::primary()).unwrap();
        assert_eq!(obj.global_shape, vec![1]);
        assert_eq!(obj.global_offset, vec![0]);
    }

    #[test]
    fn test_object_offsets_must_be_contiguous() {
        let err = to_sharded_object("x", vec![], &[AxisOffset::new(1, 0, 2)], ReplicaId::primary()).unwrap_err();
        assert!(matches!(err, ShardBridgeError::ShapeMismatch { .. }));
    }
}
