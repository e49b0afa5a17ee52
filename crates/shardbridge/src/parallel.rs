//! Rank queries against the process-group layout.
//!
//! Conversion never communicates; it only needs to know where the current
//! process sits. Live runtimes implement [`ParallelState`] over their own
//! process groups, [`ParallelLayout`] derives the answers from the parallel
//! degrees alone.

use shardbridge_core::{ParallelConfig, Result, ShardBridgeError};

use crate::dist::Placement;

/// Rank and group queries used while converting state dicts.
pub trait ParallelState {
    fn global_rank(&self) -> usize;

    fn context_parallel_rank(&self) -> usize;

    /// Rank inside the data-parallel group, optionally folded with the
    /// context-parallel group.
    fn data_parallel_rank(&self, with_context_parallel: bool) -> usize;

    fn data_parallel_world_size(&self, with_context_parallel: bool) -> usize;

    /// Placement recorded on local shards built by this process.
    fn placement(&self) -> Placement {
        Placement::cpu(self.global_rank())
    }
}

/// Rank layout derived from [`ParallelConfig`].
///
/// Ranks are ordered tensor, context, data, pipeline with the tensor-parallel
/// rank varying fastest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelLayout {
    config: ParallelConfig,
    global_rank: usize,
    device: String,
}

impl ParallelLayout {
    pub fn new(config: ParallelConfig, global_rank: usize) -> Result<Self> {
        config.validate()?;
        let world_size = config.world_size();
        if global_rank >= world_size {
            return Err(ShardBridgeError::InvalidConfig(format!(
                "global rank {global_rank} out of range for world size {world_size}"
            )));
        }
        Ok(Self {
            config,
            global_rank,
            device: "cpu".into(),
        })
    }

    /// Layout of a job with a single process.
    pub fn single_process() -> Self {
        Self {
            config: ParallelConfig::default(),
            global_rank: 0,
            device: "cpu".into(),
        }
    }

    /// Layouts of every rank in the job, in global-rank order.
    pub fn all_ranks(config: ParallelConfig) -> Result<Vec<Self>> {
        config.validate()?;
        (0..config.world_size())
            .map(|rank| Self::new(config, rank))
            .collect()
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn tensor_parallel_rank(&self) -> usize {
        self.global_rank % self.config.tensor_parallel
    }

    pub fn pipeline_parallel_rank(&self) -> usize {
        self.global_rank
            / (self.config.tensor_parallel * self.config.context_parallel * self.config.data_parallel)
    }

    fn pure_data_parallel_rank(&self) -> usize {
        (self.global_rank / (self.config.tensor_parallel * self.config.context_parallel))
            % self.config.data_parallel
    }
}

impl ParallelState for ParallelLayout {
    fn global_rank(&self) -> usize {
        self.global_rank
    }

    fn context_parallel_rank(&self) -> usize {
        (self.global_rank / self.config.tensor_parallel) % self.config.context_parallel
    }

    fn data_parallel_rank(&self, with_context_parallel: bool) -> usize {
        if with_context_parallel {
            self.pure_data_parallel_rank() * self.config.context_parallel
                + self.context_parallel_rank()
        } else {
            self.pure_data_parallel_rank()
        }
    }

    fn data_parallel_world_size(&self, with_context_parallel: bool) -> usize {
        if with_context_parallel {
            self.config.data_parallel * self.config.context_parallel
        } else {
            self.config.data_parallel
        }
    }

    fn placement(&self) -> Placement {
        Placement::new(self.global_rank, self.device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ParallelConfig {
        ParallelConfig {
            tensor_parallel: 2,
            pipeline_parallel: 2,
            context_parallel: 2,
            data_parallel: 2,
        }
    }

    #[test]
    fn test_rank_decomposition() {
        // rank 13 = tp 1 + 2 * (cp 0 + 2 * (dp 1 + 2 * pp 1))
        let layout = ParallelLayout::new(config(), 13).unwrap();
        assert_eq!(layout.tensor_parallel_rank(), 1);
        assert_eq!(layout.context_parallel_rank(), 0);
        assert_eq!(layout.data_parallel_rank(false), 1);
        assert_eq!(layout.data_parallel_rank(true), 2);
        assert_eq!(layout.pipeline_parallel_rank(), 1);
        assert_eq!(layout.data_parallel_world_size(true), 4);
        assert_eq!(layout.data_parallel_world_size(false), 2);
    }

    #[test]
    fn test_data_context_ranks_are_distinct_within_group() {
        let layouts = ParallelLayout::all_ranks(config()).unwrap();
        assert_eq!(layouts.len(), 16);

        // Ranks sharing tp and pp form one data+context group.
        let mut group: Vec<usize> = layouts
            .iter()
            .filter(|l| l.tensor_parallel_rank() == 0 && l.pipeline_parallel_rank() == 0)
            .map(|l| l.data_parallel_rank(true))
            .collect();
        group.sort_unstable();
        assert_eq!(group, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_rank_out_of_range() {
        assert!(ParallelLayout::new(config(), 16).is_err());
    }

    #[test]
    fn test_placement_uses_device() {
        let layout = ParallelLayout::new(config(), 3).unwrap().with_device("cuda:1");
        assert_eq!(layout.placement(), Placement::new(3, "cuda:1"));
        assert_eq!(ParallelLayout::single_process().placement(), Placement::cpu(0));
    }
}
