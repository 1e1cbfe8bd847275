use std::time::Duration;

/// Every how many batches the running loss is reported.
pub const PRINT_FREQ: usize = 10;

/// The amount of leading batches left out of the throughput average.
const FPS_WARMUP: usize = 5;

/// Running statistics of one training epoch.
#[derive(Debug, Default, Clone)]
pub struct EpochMetrics {
    running_loss: f32,
    fps: Vec<f64>,
    pub batches: usize,
    pub samples: usize,
}

impl EpochMetrics {
    /// Records the loss of the `i`-th batch of the epoch.
    ///
    /// # Returns
    /// The mean loss of the last `PRINT_FREQ` batches, once every `PRINT_FREQ` batches.
    pub fn record_loss(&mut self, i: usize, loss: f32, samples: usize) -> Option<f32> {
        self.batches += 1;
        self.samples += samples;
        self.running_loss += loss;

        if i % PRINT_FREQ != PRINT_FREQ - 1 {
            return None;
        }

        let mean = self.running_loss / PRINT_FREQ as f32;
        self.running_loss = 0.;
        Some(mean)
    }

    /// Records the global throughput of one batch.
    ///
    /// # Arguments
    /// * `images` - The images processed by every rank together.
    /// * `elapsed` - The time it took.
    pub fn record_throughput(&mut self, images: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs > 0. {
            self.fps.push(images as f64 / secs);
        }
    }

    /// The mean throughput of the epoch in images per second, past the warmup batches.
    pub fn fps(&self) -> Option<f64> {
        let steady = self.fps.get(FPS_WARMUP..).filter(|s| !s.is_empty())?;
        Some(steady.iter().sum::<f64>() / steady.len() as f64)
    }
}

/// Statistics of one pass over the validation set.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalMetrics {
    pub correct: usize,
    pub total: usize,
    loss_sum: f32,
    batches: usize,
}

impl EvalMetrics {
    pub fn record(&mut self, correct: usize, samples: usize, loss: f32) {
        self.correct += correct;
        self.total += samples;
        self.loss_sum += loss;
        self.batches += 1;
    }

    /// The top-1 accuracy, in `[0, 1]`.
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            return 0.;
        }

        self.correct as f32 / self.total as f32
    }

    /// The mean of the per-batch losses.
    pub fn mean_loss(&self) -> f32 {
        if self.batches == 0 {
            return 0.;
        }

        self.loss_sum / self.batches as f32
    }
}
