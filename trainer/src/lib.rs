pub mod arch;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
mod model;
pub mod state;
mod trainer;

pub use config::{Architecture, ClusterConfig, TrainerConfig};
pub use error::{Result, TrainErr};
pub use model::DistributedModel;
pub use state::{Checkpoint, TrainerState};
pub use trainer::{Session, Trainer};
