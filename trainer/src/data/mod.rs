mod dataset;
mod folder;
mod loader;
mod sampler;
mod transforms;

pub use dataset::{Dataset, InMemoryDataset, Sample};
pub use folder::FolderDataset;
pub use loader::{Batch, Batches, DataLoader};
pub use sampler::RaSampler;
pub use transforms::Transform;
