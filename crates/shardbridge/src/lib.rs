//! # Shardbridge
//!
//! Translates checkpoint state dicts between a model-parallel trainer's
//! sharded-tensor descriptors and rank-scoped distributed tensors, keeping
//! the shard geometry (global shape, offsets, fragmentation) intact so a
//! checkpoint saved under one tensor/pipeline/context-parallel layout can be
//! reloaded under another.
//!
//! ## Architecture Overview
//!
//! - **Descriptors**: [`mapping::ShardedTensor`] and [`mapping::ShardedObject`]
//!   on the checkpoint side, [`dist::DistTensor`] on the trainer side
//! - **Geometry**: [`translate`] converts one tensor in either direction,
//!   adding or stripping synthetic leading axes such as the layer index
//! - **Walk**: [`walker::StateDictConverter`] applies the translation across
//!   a nested [`state_dict::StateDict`]
//! - **Layers**: [`layers`] resolves the layer count from layer-stacked keys
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shardbridge::{ParallelLayout, StateDict, StateDictConverter};
//!
//! # fn main() -> shardbridge_core::Result<()> {
//! let converter = StateDictConverter::new(ParallelLayout::single_process());
//! let state = StateDict::new(); // collected from the model
//! let sharded = converter.split_for_save(state, "")?;
//! # let _ = sharded;
//! # Ok(())
//! # }
//! ```

pub mod dist;
pub mod layers;
pub mod logging;
pub mod mapping;
pub mod parallel;
pub mod paths;
pub mod state_dict;
pub mod translate;
pub mod walker;

pub use dist::{DistTensor, LocalShard, Placement, ShardMetadata};
pub use layers::{parse_layer_key, resolve_num_layers, LayerKey};
pub use mapping::{AxisOffset, ReplicaId, ShardedObject, ShardedTensor};
pub use parallel::{ParallelLayout, ParallelState};
pub use paths::{checkpoint_dir, configured_checkpoint_dir};
pub use state_dict::{leaf_paths, StateDict, StateValue};
pub use translate::{to_dist_tensor, to_sharded_object, to_sharded_tensors};
pub use walker::StateDictConverter;
