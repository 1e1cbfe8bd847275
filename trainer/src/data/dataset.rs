use crate::{Result, TrainErr};

/// A single labeled image, row-major pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// Random access to labeled samples of one fixed size.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_classes(&self) -> usize;

    /// The amount of pixels of every sample.
    fn sample_len(&self) -> usize;

    /// Returns a fresh copy of the sample at `index`.
    fn get(&self, index: usize) -> Result<Sample>;
}

/// A dataset held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
    num_classes: usize,
    sample_len: usize,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned samples.
    ///
    /// # Returns
    /// An error if the samples differ in size or a label is not below `num_classes`.
    pub fn new(samples: Vec<Sample>, num_classes: usize) -> Result<Self> {
        let sample_len = samples.first().map(|s| s.pixels.len()).unwrap_or_default();

        for (i, sample) in samples.iter().enumerate() {
            if sample.pixels.len() != sample_len {
                return Err(TrainErr::InvalidConfig(format!(
                    "sample {i} has {} pixels, expected {sample_len}",
                    sample.pixels.len()
                )));
            }

            if sample.label >= num_classes {
                return Err(TrainErr::InvalidConfig(format!(
                    "sample {i} has label {} but there are {num_classes} classes",
                    sample.label
                )));
            }
        }

        Ok(Self {
            samples,
            num_classes,
            sample_len,
        })
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn sample_len(&self) -> usize {
        self.sample_len
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            TrainErr::InvalidConfig(format!(
                "sample {index} is out of range for {} samples",
                self.samples.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pixels: &[f32], label: usize) -> Sample {
        Sample {
            pixels: pixels.to_vec(),
            label,
        }
    }

    #[test]
    fn in_memory_basic() {
        let ds = InMemoryDataset::new(vec![sample(&[1., 2.], 0), sample(&[3., 4.], 1)], 2).unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.sample_len(), 2);
        assert_eq!(ds.get(1).unwrap(), sample(&[3., 4.], 1));
        assert!(ds.get(2).is_err());
    }

    #[test]
    fn rejects_ragged_samples_and_bad_labels() {
        assert!(InMemoryDataset::new(vec![sample(&[1.], 0), sample(&[1., 2.], 0)], 1).is_err());
        assert!(InMemoryDataset::new(vec![sample(&[1.], 3)], 3).is_err());
    }
}
