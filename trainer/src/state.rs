//! The live training state and its on-disk image.
//!
//! `TrainerState` owns the runtime objects of a job. `Checkpoint` is the plain data taken out of
//! them, and is what gets written to and read from disk. A checkpoint is a safetensors file: the
//! model parameters as `model.<name>`, the optimizer velocity as `optimizer.velocity`, and the
//! scalar state as JSON strings in the header metadata.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use machine_learning::{
    StateDict, Tensor,
    amp::LossScalerState,
    arch::Model,
    optimization::{Sgd, SgdHyper, SgdState},
    scheduler::{StepLr, StepLrState},
};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{DistributedModel, Result, TrainErr};

const FORMAT: &str = "trainer-checkpoint/1";
const MODEL_PREFIX: &str = "model.";
const VELOCITY: &str = "optimizer.velocity";

/// Everything a training job needs to resume.
pub struct TrainerState {
    /// The epoch in progress, or the next one to run.
    pub epoch: usize,
    /// The accuracy of the most recent evaluation.
    pub accuracy: f32,
    pub model: DistributedModel,
    pub optimizer: Sgd,
    pub lr_scheduler: StepLr,
}

impl TrainerState {
    /// Creates a fresh state at epoch 0 with no accuracy measured.
    pub fn new(model: DistributedModel, optimizer: Sgd, lr_scheduler: StepLr) -> Self {
        Self {
            epoch: 0,
            accuracy: 0.,
            model,
            optimizer,
            lr_scheduler,
        }
    }

    /// Writes the state to `path`, replacing any previous file.
    pub fn save(&self, path: &Path) -> Result<()> {
        Checkpoint::capture(self).write(path)
    }

    /// Reads the checkpoint at `path` into `default`.
    ///
    /// The runtime objects of `default` are reused as load targets, only their internal state
    /// is replaced.
    ///
    /// # Returns
    /// The restored state, or an error if the file is missing, malformed, or doesn't fit the
    /// objects of `default`.
    pub fn load(path: &Path, default: TrainerState) -> Result<TrainerState> {
        let checkpoint = Checkpoint::read(path)?;
        let mut state = default;
        checkpoint.restore(&mut state)?;
        Ok(state)
    }
}

/// The serializable image of a `TrainerState`.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub epoch: usize,
    pub accuracy: f32,
    pub model: StateDict,
    pub optimizer: SgdState,
    pub lr_scheduler: StepLrState,
    pub amp: LossScalerState,
}

impl Checkpoint {
    /// Copies the internal state out of the runtime objects of `state`.
    pub fn capture(state: &TrainerState) -> Self {
        Self {
            epoch: state.epoch,
            accuracy: state.accuracy,
            model: state.model.module().state_dict(),
            optimizer: state.optimizer.state_dict(),
            lr_scheduler: state.lr_scheduler.state_dict(),
            amp: state.model.scaler().state_dict(),
        }
    }

    /// Overwrites the internal state of the runtime objects of `state`.
    pub fn restore(&self, state: &mut TrainerState) -> Result<()> {
        state.model.module_mut().load_state_dict(&self.model)?;
        state.optimizer.load_state_dict(&self.optimizer)?;
        state.lr_scheduler.load_state_dict(&self.lr_scheduler);
        state.model.scaler_mut().load_state_dict(&self.amp);
        state.epoch = self.epoch;
        state.accuracy = self.accuracy;
        Ok(())
    }

    /// Serializes the checkpoint into a safetensors buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut views = Vec::with_capacity(self.model.len() + 1);

        for (name, tensor) in &self.model {
            let view = TensorView::new(
                Dtype::F32,
                tensor.shape.clone(),
                bytemuck::cast_slice(&tensor.data),
            )
            .map_err(|e| TrainErr::checkpoint(name.as_str(), e))?;
            views.push((format!("{MODEL_PREFIX}{name}"), view));
        }

        let velocity = &self.optimizer.velocity;
        let view = TensorView::new(
            Dtype::F32,
            vec![velocity.len()],
            bytemuck::cast_slice(velocity),
        )
        .map_err(|e| TrainErr::checkpoint(VELOCITY, e))?;
        views.push((VELOCITY.to_string(), view));

        let metadata = HashMap::from([
            ("format".to_string(), FORMAT.to_string()),
            ("epoch".to_string(), self.epoch.to_string()),
            ("accuracy".to_string(), self.accuracy.to_string()),
            (
                "optimizer".to_string(),
                serde_json::to_string(&self.optimizer.hyper)?,
            ),
            (
                "lr_scheduler".to_string(),
                serde_json::to_string(&self.lr_scheduler)?,
            ),
            ("amp".to_string(), serde_json::to_string(&self.amp)?),
        ]);

        safetensors::serialize(views, &Some(metadata))
            .map_err(|e| TrainErr::checkpoint("<buffer>", e))
    }

    /// Parses a safetensors buffer written by `to_bytes`.
    ///
    /// # Arguments
    /// * `bytes` - The buffer.
    /// * `path` - Where the buffer came from, for error reports.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        let bad = |reason: String| TrainErr::checkpoint(path, reason);

        let (_, header) = SafeTensors::read_metadata(bytes).map_err(|e| bad(e.to_string()))?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| bad("no metadata".into()))?;

        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| bad(format!("missing metadata key {key}")))
        };

        if field("format")? != FORMAT {
            return Err(bad(format!("unknown format {}", field("format")?)));
        }

        let epoch = field("epoch")?
            .parse::<usize>()
            .map_err(|e| bad(format!("epoch: {e}")))?;
        let accuracy = field("accuracy")?
            .parse::<f32>()
            .map_err(|e| bad(format!("accuracy: {e}")))?;
        let hyper: SgdHyper = serde_json::from_str(field("optimizer")?)?;
        let lr_scheduler: StepLrState = serde_json::from_str(field("lr_scheduler")?)?;
        let amp: LossScalerState = serde_json::from_str(field("amp")?)?;

        let tensors = SafeTensors::deserialize(bytes).map_err(|e| bad(e.to_string()))?;
        let mut model = StateDict::new();
        let mut velocity = None;

        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(bad(format!("tensor {name} is {:?}, expected F32", view.dtype())));
            }

            let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());

            if name == VELOCITY {
                velocity = Some(data);
            } else if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
                model.insert(param.to_string(), Tensor::new(view.shape().to_vec(), data)?);
            } else {
                debug!("ignoring checkpoint tensor {name}");
            }
        }

        let velocity = velocity.ok_or_else(|| bad(format!("missing tensor {VELOCITY}")))?;

        Ok(Self {
            epoch,
            accuracy,
            model,
            optimizer: SgdState { hyper, velocity },
            lr_scheduler,
            amp,
        })
    }

    /// Writes the checkpoint through a temporary file so `path` never holds a partial write.
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let tmp = tmp_path(path);

        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;

        debug!(epoch = self.epoch; "checkpoint written to {}", path.display());
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes, path)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use machine_learning::{StateDict, Tensor};

    use super::*;

    fn checkpoint() -> Checkpoint {
        let mut model = StateDict::new();
        model.insert(
            "layers.0.weight".into(),
            Tensor::new(vec![2, 1], vec![0.25, -1.5]).unwrap(),
        );
        model.insert("layers.0.bias".into(), Tensor::new(vec![1], vec![0.1]).unwrap());

        Checkpoint {
            epoch: 15,
            accuracy: 0.731,
            model,
            optimizer: SgdState {
                hyper: SgdHyper {
                    learning_rate: 0.2,
                    momentum: 0.9,
                    weight_decay: 1e-4,
                },
                velocity: vec![0.5, 0.25, -0.125],
            },
            lr_scheduler: StepLrState {
                base_lr: 0.2,
                step_size: NonZeroUsize::new(30).unwrap(),
                gamma: 0.1,
                last_epoch: 15,
            },
            amp: LossScalerState {
                loss_scale: 32768.0,
                stable_steps: 17,
            },
        }
    }

    #[test]
    fn bytes_round_trip() {
        let ckpt = checkpoint();
        let bytes = ckpt.to_bytes().unwrap();

        assert_eq!(Checkpoint::from_bytes(&bytes, Path::new("mem")).unwrap(), ckpt);
    }

    #[test]
    fn write_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.pth");

        checkpoint().write(&path).unwrap();
        checkpoint().write(&path).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["checkpoint.pth"]);
        assert_eq!(Checkpoint::read(&path).unwrap().epoch, 15);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let bytes = checkpoint().to_bytes().unwrap();

        let result = Checkpoint::from_bytes(&bytes[..bytes.len() / 2], Path::new("cut.pth"));
        assert!(matches!(result, Err(TrainErr::Checkpoint { .. })));
    }

    #[test]
    fn garbage_is_rejected() {
        let result = Checkpoint::from_bytes(b"not a checkpoint", Path::new("junk.pth"));
        assert!(matches!(result, Err(TrainErr::Checkpoint { .. })));
    }
}
