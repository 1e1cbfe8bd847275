use std::{io, sync::Arc};

use ndarray::Array2;
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

use super::{Dataset, RaSampler, Transform, transforms::sample_rng};
use crate::Result;

/// A decoded mini-batch, one sample per row.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug)]
enum Order {
    Sampler(RaSampler),
    Sequential,
}

/// Turns a dataset into batches, decoding the samples of a batch in parallel.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    order: Order,
    batch_size: usize,
    transform: Transform,
    seed: u64,
    epoch: usize,
    pool: ThreadPool,
}

impl DataLoader {
    /// Creates a loader following the order of `sampler`.
    ///
    /// # Arguments
    /// * `dataset` - The samples to load.
    /// * `sampler` - Decides which indices this rank loads each epoch.
    /// * `transform` - The preprocessing applied to every sample.
    /// * `workers` - The amount of decoding threads.
    /// * `seed` - Seeds the augmentation draws.
    pub fn with_sampler(
        dataset: Arc<dyn Dataset>,
        sampler: RaSampler,
        transform: Transform,
        workers: usize,
        seed: u64,
    ) -> Result<Self> {
        let batch_size = sampler.batch_size();
        Self::new(dataset, Order::Sampler(sampler), batch_size, transform, workers, seed)
    }

    /// Creates a loader going through the whole dataset in index order.
    pub fn sequential(
        dataset: Arc<dyn Dataset>,
        batch_size: usize,
        transform: Transform,
        workers: usize,
    ) -> Result<Self> {
        Self::new(dataset, Order::Sequential, batch_size, transform, workers, 0)
    }

    fn new(
        dataset: Arc<dyn Dataset>,
        order: Order,
        batch_size: usize,
        transform: Transform,
        workers: usize,
        seed: u64,
    ) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("loader-{i}"))
            .build()
            .map_err(io::Error::other)?;

        Ok(Self {
            dataset,
            order,
            batch_size: batch_size.max(1),
            transform,
            seed,
            epoch: 0,
            pool,
        })
    }

    pub fn dataset(&self) -> &dyn Dataset {
        self.dataset.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Moves the loader, and its sampler if any, to `epoch`.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        if let Order::Sampler(sampler) = &mut self.order {
            sampler.set_epoch(epoch);
        }
    }

    /// The dataset indices of the current epoch, in load order.
    pub fn indices(&self) -> Vec<usize> {
        match &self.order {
            Order::Sampler(sampler) => sampler.indices(),
            Order::Sequential => (0..self.dataset.len()).collect(),
        }
    }

    /// The amount of batches of the current epoch.
    pub fn len(&self) -> usize {
        let samples = match &self.order {
            Order::Sampler(sampler) => sampler.num_samples(),
            Order::Sequential => self.dataset.len(),
        };

        samples.div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the batches of the current epoch, the last one may be short.
    pub fn iter(&self) -> Batches<'_> {
        Batches {
            loader: self,
            indices: self.indices(),
            cursor: 0,
        }
    }

    fn load(&self, start: usize, indices: &[usize]) -> Result<Batch> {
        let samples = self.pool.install(|| {
            indices
                .par_iter()
                .enumerate()
                .map(|(offset, &index)| {
                    let mut sample = self.dataset.get(index)?;
                    let mut rng = sample_rng(self.seed, self.epoch, start + offset);
                    self.transform.apply(&mut sample.pixels, &mut rng);
                    Ok(sample)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let features = self.dataset.sample_len();
        let mut flat = Vec::with_capacity(samples.len() * features);
        let mut labels = Vec::with_capacity(samples.len());

        for sample in samples {
            flat.extend_from_slice(&sample.pixels);
            labels.push(sample.label);
        }

        let x = Array2::from_shape_vec((labels.len(), features), flat)
            .map_err(machine_learning::MlErr::from)?;

        Ok(Batch { x, labels })
    }
}

/// The batches of one epoch.
pub struct Batches<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }

        let start = self.cursor;
        let end = (start + self.loader.batch_size).min(self.indices.len());
        self.cursor = end;

        Some(self.loader.load(start, &self.indices[start..end]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.indices.len() - self.cursor).div_ceil(self.loader.batch_size);
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::data::{InMemoryDataset, Sample};

    fn dataset(n: usize) -> Arc<dyn Dataset> {
        let samples = (0..n)
            .map(|i| Sample {
                pixels: vec![i as f32; 4],
                label: i % 2,
            })
            .collect();

        Arc::new(InMemoryDataset::new(samples, 2).unwrap())
    }

    #[test]
    fn sequential_batches_cover_the_dataset_in_order() {
        let loader = DataLoader::sequential(dataset(5), 2, Transform::val(2), 2).unwrap();
        assert_eq!(loader.len(), 3);

        let batches: Vec<Batch> = loader.iter().collect::<Result<_>>().unwrap();
        let labels: Vec<usize> = batches.iter().flat_map(|b| b.labels.clone()).collect();

        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(labels, vec![0, 1, 0, 1, 0]);
        assert_eq!(batches[0].x.dim(), (2, 4));
    }

    #[test]
    fn sampler_loader_follows_the_rank_slice() {
        let one = NonZeroUsize::MIN;
        let sampler = RaSampler::new(6, NonZeroUsize::new(2).unwrap(), 1, NonZeroUsize::new(4).unwrap())
            .unwrap()
            .repetitions(one)
            .len_factor(1.0)
            .shuffle(false);

        let loader = DataLoader::with_sampler(dataset(6), sampler, Transform::val(2), 1, 0).unwrap();
        assert_eq!(loader.indices(), vec![1, 3, 5]);
        assert_eq!(loader.len(), 1);

        let batch = loader.iter().next().unwrap().unwrap();
        assert_eq!(batch.labels, vec![1, 1, 1]);
    }

    #[test]
    fn epochs_are_reproducible() {
        let make = || {
            let sampler = RaSampler::new(8, NonZeroUsize::MIN, 0, NonZeroUsize::new(4).unwrap())
                .unwrap();
            let mut loader =
                DataLoader::with_sampler(dataset(8), sampler, Transform::train(2), 3, 9).unwrap();
            loader.set_epoch(4);
            loader
                .iter()
                .map(|b| b.unwrap().x)
                .collect::<Vec<_>>()
        };

        assert_eq!(make(), make());
    }
}
