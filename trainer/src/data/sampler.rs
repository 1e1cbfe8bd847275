use std::num::NonZeroUsize;

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{Result, TrainErr};

/// Repeated augmentation sampler.
///
/// Every epoch draws a global order in which each dataset index appears `repetitions` times in
/// a row, drawing as many permutations as needed to fill `floor(len * len_factor)` positions.
/// Every rank computes the same global order from the epoch seed and keeps the positions
/// `rank, rank + world, rank + 2 * world, ...` of it, so no communication is needed to agree on
/// a partition.
#[derive(Debug, Clone)]
pub struct RaSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    batch_size: usize,
    repetitions: usize,
    len_factor: f64,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: usize,
}

impl RaSampler {
    /// Creates a new `RaSampler` with 3 repetitions, a length factor of 2 and shuffling on.
    ///
    /// # Arguments
    /// * `dataset_len` - The amount of samples in the dataset.
    /// * `num_replicas` - The amount of ranks sharing the epoch.
    /// * `rank` - The rank this sampler produces indices for.
    /// * `batch_size` - The batch size of each rank.
    ///
    /// # Returns
    /// A new `RaSampler`, or an error if `rank` is not below `num_replicas`.
    pub fn new(
        dataset_len: usize,
        num_replicas: NonZeroUsize,
        rank: usize,
        batch_size: NonZeroUsize,
    ) -> Result<Self> {
        if rank >= num_replicas.get() {
            return Err(TrainErr::InvalidConfig(format!(
                "sampler rank {rank} is out of range for {num_replicas} replicas"
            )));
        }

        Ok(Self {
            dataset_len,
            num_replicas: num_replicas.get(),
            rank,
            batch_size: batch_size.get(),
            repetitions: 3,
            len_factor: 2.0,
            shuffle: true,
            drop_last: false,
            seed: 0,
            epoch: 0,
        })
    }

    pub fn repetitions(mut self, repetitions: NonZeroUsize) -> Self {
        self.repetitions = repetitions.get();
        self
    }

    /// Sets the ratio between the epoch length and the dataset length, non positive factors
    /// produce empty epochs.
    pub fn len_factor(mut self, len_factor: f64) -> Self {
        self.len_factor = len_factor;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The length of the global order, `floor(dataset_len * len_factor)`.
    pub fn total_len(&self) -> usize {
        if self.len_factor <= 0. {
            return 0;
        }

        (self.dataset_len as f64 * self.len_factor).floor() as usize
    }

    /// The amount of indices this rank receives per epoch.
    pub fn num_samples(&self) -> usize {
        let total = self.total_len();

        if self.drop_last {
            total / self.num_replicas
        } else {
            total.div_ceil(self.num_replicas)
        }
    }

    /// The amount of batches this rank receives per epoch.
    pub fn num_batches(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    /// The order every rank agrees on for the current epoch, before sharding.
    pub fn global_order(&self) -> Vec<usize> {
        let total = self.total_len();
        let mut order = Vec::with_capacity(total + self.repetitions);

        if self.dataset_len == 0 {
            return order;
        }

        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
        let mut perm: Vec<usize> = (0..self.dataset_len).collect();

        while order.len() < total {
            if self.shuffle {
                perm.shuffle(&mut rng);
            }

            for &index in &perm {
                if order.len() >= total {
                    break;
                }

                for _ in 0..self.repetitions {
                    order.push(index);
                }
            }
        }

        order.truncate(total);
        order
    }

    /// The global order cut or wrapped to an exact multiple of the world size.
    fn padded_order(&self) -> Vec<usize> {
        let mut order = self.global_order();
        let padded_len = self.num_samples() * self.num_replicas;

        if padded_len <= order.len() {
            order.truncate(padded_len);
        } else {
            let pad: Vec<usize> = order
                .iter()
                .cycle()
                .take(padded_len - order.len())
                .copied()
                .collect();
            order.extend(pad);
        }

        order
    }

    /// The indices of this rank for the current epoch, in order.
    pub fn indices(&self) -> Vec<usize> {
        self.padded_order()
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }

    pub fn iter(&self) -> std::vec::IntoIter<usize> {
        self.indices().into_iter()
    }
}

impl IntoIterator for &RaSampler {
    type Item = usize;
    type IntoIter = std::vec::IntoIter<usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn sampler(n: usize, world: usize, rank: usize) -> RaSampler {
        RaSampler::new(n, nz(world), rank, nz(8)).unwrap()
    }

    #[test]
    fn each_index_repeats_consecutively() {
        let order = sampler(10, 1, 0).len_factor(3.0).global_order();

        assert_eq!(order.len(), 30);
        for chunk in order.chunks(3) {
            assert!(chunk.iter().all(|&i| i == chunk[0]));
        }

        let mut counts = [0; 10];
        for i in order {
            counts[i] += 1;
        }
        assert_eq!(counts, [3; 10]);
    }

    #[test]
    fn sequential_order_without_shuffle() {
        let order = sampler(4, 1, 0).shuffle(false).len_factor(1.5).global_order();

        assert_eq!(order, vec![0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn short_orders_draw_more_permutations() {
        let order = sampler(3, 1, 0)
            .repetitions(nz(1))
            .len_factor(2.0)
            .shuffle(false)
            .global_order();

        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn epochs_change_the_order_deterministically() {
        let mut a = sampler(50, 1, 0);
        let b = sampler(50, 1, 0);

        a.set_epoch(0);
        assert_eq!(a.global_order(), b.global_order());

        a.set_epoch(1);
        assert_ne!(a.global_order(), b.global_order());

        let again = {
            let mut s = sampler(50, 1, 0);
            s.set_epoch(1);
            s.global_order()
        };
        assert_eq!(a.global_order(), again);
    }

    #[test]
    fn reference_partition() {
        let samplers: Vec<_> = (0..4).map(|r| sampler(100, 4, r)).collect();
        let global = samplers[0].global_order();
        assert_eq!(global.len(), 200);

        let shards: Vec<Vec<usize>> = samplers.iter().map(RaSampler::indices).collect();
        for shard in &shards {
            assert_eq!(shard.len(), 50);
        }

        let mut rebuilt = Vec::with_capacity(200);
        for i in 0..50 {
            for shard in &shards {
                rebuilt.push(shard[i]);
            }
        }
        assert_eq!(rebuilt, global);
    }

    #[test]
    fn pads_by_wrapping_without_drop_last() {
        let s = sampler(5, 4, 3).shuffle(false).repetitions(nz(1)).len_factor(1.0);

        assert_eq!(s.total_len(), 5);
        assert_eq!(s.num_samples(), 2);
        assert_eq!(s.indices(), vec![3, 2]);
    }

    #[test]
    fn drop_last_truncates() {
        let s = sampler(5, 4, 0).shuffle(false).repetitions(nz(1)).len_factor(1.0).drop_last(true);

        assert_eq!(s.num_samples(), 1);
        assert_eq!(s.indices(), vec![0]);
    }

    #[test]
    fn empty_dataset_yields_nothing() {
        let s = sampler(0, 2, 1);

        assert_eq!(s.num_samples(), 0);
        assert!(s.indices().is_empty());
    }

    #[test]
    fn rank_must_be_below_world() {
        assert!(RaSampler::new(10, nz(2), 2, nz(1)).is_err());
    }
}
