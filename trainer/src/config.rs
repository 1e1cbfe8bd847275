use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use distributed::Backend;
use machine_learning::amp::Precision;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

/// The amount of canonical examples an epoch is capped at.
pub const EPOCH_EXAMPLES: usize = 5005 * 512;

const CHECKPOINT_FILE: &str = "checkpoint.pth";
const CONFIG_FILE: &str = "config.json";

/// The classifier to train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Linear,
    #[default]
    Mlp,
}

/// The hyperparameters and topology of a training job, immutable once the job starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Holds the `train` and `val` image folders.
    pub data_folder: PathBuf,
    pub epochs: NonZeroUsize,
    /// The base learning rate, scaled linearly with the global batch size.
    pub lr: f32,
    /// The side of the square input images.
    pub input_size: NonZeroUsize,
    pub batch_per_gpu: NonZeroUsize,
    pub save_folder: PathBuf,
    /// The amount of cpus a rank may use, one of them drives the training loop.
    pub workers: NonZeroUsize,
    pub local_rank: usize,
    pub global_rank: usize,
    pub num_tasks: NonZeroUsize,
    pub job_id: String,
    #[serde(default)]
    pub architecture: Architecture,
    /// Model parameters to start from instead of a random init.
    #[serde(default)]
    pub weights: Option<PathBuf>,
    /// Whether every rank waits for rank 0's evaluation and checkpoint before the next epoch.
    #[serde(default = "default_sync_after_eval")]
    pub sync_after_eval: bool,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_repetitions")]
    pub repetitions: NonZeroUsize,
    #[serde(default = "default_len_factor")]
    pub len_factor: f64,
    #[serde(default = "default_epoch_examples")]
    pub epoch_examples: usize,
}

pub(crate) const fn nz(n: usize) -> NonZeroUsize {
    match NonZeroUsize::new(n) {
        Some(n) => n,
        None => NonZeroUsize::MIN,
    }
}

fn default_sync_after_eval() -> bool {
    true
}

fn default_repetitions() -> NonZeroUsize {
    nz(3)
}

fn default_len_factor() -> f64 {
    2.0
}

fn default_epoch_examples() -> usize {
    EPOCH_EXAMPLES
}

impl TrainerConfig {
    /// Creates a single rank configuration with the from-scratch recipe's defaults.
    ///
    /// # Arguments
    /// * `data_folder` - The folder holding the `train` and `val` splits.
    /// * `save_folder` - The folder checkpoints are written under.
    /// * `job_id` - The name of the job, its checkpoints live in `save_folder/job_id`.
    pub fn new(
        data_folder: impl Into<PathBuf>,
        save_folder: impl Into<PathBuf>,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            data_folder: data_folder.into(),
            epochs: nz(120),
            lr: 0.025,
            input_size: nz(224),
            batch_per_gpu: nz(64),
            save_folder: save_folder.into(),
            workers: nz(10),
            local_rank: 0,
            global_rank: 0,
            num_tasks: NonZeroUsize::MIN,
            job_id: job_id.into(),
            architecture: Architecture::default(),
            weights: None,
            sync_after_eval: default_sync_after_eval(),
            precision: Precision::default(),
            seed: 0,
            repetitions: default_repetitions(),
            len_factor: default_len_factor(),
            epoch_examples: EPOCH_EXAMPLES,
        }
    }

    /// Checks the values a type can't enforce.
    pub fn validate(&self) -> Result<()> {
        if self.global_rank >= self.num_tasks.get() {
            return Err(TrainErr::InvalidConfig(format!(
                "global rank {} is out of range for {} tasks",
                self.global_rank, self.num_tasks
            )));
        }

        if !(self.lr.is_finite() && self.lr > 0.) {
            return Err(TrainErr::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }

        if !(self.len_factor.is_finite() && self.len_factor > 0.) {
            return Err(TrainErr::InvalidConfig(format!(
                "length factor must be positive, got {}",
                self.len_factor
            )));
        }

        if self.job_id.is_empty() || self.job_id.contains(['/', '\\']) {
            return Err(TrainErr::InvalidConfig(format!(
                "job id must be a plain name, got {:?}",
                self.job_id
            )));
        }

        Ok(())
    }

    /// The learning rate after linear scaling with the global batch size.
    pub fn scaled_lr(&self) -> f32 {
        8.0 * self.lr * self.global_batch() as f32 / 512.0
    }

    pub fn global_batch(&self) -> usize {
        self.batch_per_gpu.get() * self.num_tasks.get()
    }

    /// The amount of batches after which a rank stops consuming its epoch.
    pub fn batches_per_epoch_cap(&self) -> f64 {
        self.epoch_examples as f64 / self.global_batch() as f64
    }

    pub fn is_last_epoch(&self, epoch: usize) -> bool {
        epoch + 1 == self.epochs.get()
    }

    pub fn train_folder(&self) -> PathBuf {
        self.data_folder.join("train")
    }

    pub fn val_folder(&self) -> PathBuf {
        self.data_folder.join("val")
    }

    pub fn job_folder(&self) -> PathBuf {
        self.save_folder.join(&self.job_id)
    }

    /// The always overwritten latest checkpoint of the job.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.job_folder().join(CHECKPOINT_FILE)
    }

    /// The permanent checkpoint of `epoch`.
    pub fn epoch_checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.job_folder().join(format!("checkpoint_{epoch}.pth"))
    }

    /// Writes the configuration as `config.json` in the job folder.
    pub fn save(&self) -> Result<PathBuf> {
        let dir = self.job_folder();
        fs::create_dir_all(&dir)?;

        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// How the ranks of a job find each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub dist_backend: Backend,
    /// Either `file://<path>` or `local://<name>`.
    pub dist_url: String,
    pub timeout: Duration,
}

impl ClusterConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    pub fn new(dist_backend: Backend, dist_url: impl Into<String>) -> Self {
        Self {
            dist_backend,
            dist_url: dist_url.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// A rendezvous on `path`.
    pub fn with_init_file(dist_backend: Backend, path: &Path) -> Self {
        Self::new(dist_backend, format!("file://{}", path.display()))
    }

    /// The rendezvous file behind a `file://` url.
    pub fn init_file(&self) -> Option<PathBuf> {
        self.dist_url
            .strip_prefix("file://")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }
}
