#![allow(dead_code)]

use std::{fs, num::NonZeroUsize, path::Path, time::Duration};

use distributed::Backend;
use machine_learning::amp::Precision;
use trainer::{Architecture, ClusterConfig, TrainerConfig, data::FolderDataset};

pub const SIDE: usize = 4;

pub fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// Class 0 is bright on top, class 1 is bright at the bottom. Both survive horizontal flips.
fn image(label: usize, k: usize) -> Vec<f32> {
    (0..SIDE * SIDE)
        .map(|p| {
            let top = p / SIDE < SIDE / 2;
            let bright = top == (label == 0);
            let noise = 0.05 * ((p * 7 + k * 13) % 5) as f32;
            if bright { 1.0 - noise } else { noise }
        })
        .collect()
}

/// Writes a two class image folder dataset with `per_class` samples per class and split.
pub fn write_dataset(data_folder: &Path, per_class: usize) {
    for split in ["train", "val"] {
        for (label, class) in ["bottom_dark", "top_dark"].iter().enumerate() {
            let dir = data_folder.join(split).join(class);
            fs::create_dir_all(&dir).unwrap();

            for k in 0..per_class {
                let path = dir.join(format!("{k:04}.bin"));
                FolderDataset::write_sample(&path, &image(label, k)).unwrap();
            }
        }
    }
}

/// A small job over the dataset written by `write_dataset` under `root/data`.
pub fn config(root: &Path, job_id: &str) -> TrainerConfig {
    let mut cfg = TrainerConfig::new(root.join("data"), root.join("shared"), job_id);
    cfg.epochs = nz(2);
    cfg.lr = 0.5;
    cfg.input_size = nz(SIDE);
    cfg.batch_per_gpu = nz(8);
    cfg.workers = nz(3);
    cfg.architecture = Architecture::Linear;
    cfg.precision = Precision::Full;
    cfg
}

/// Creates `root/data` with 16 samples per class and split, and `root/shared`.
pub fn setup(root: &Path) {
    write_dataset(&root.join("data"), 16);
    fs::create_dir_all(root.join("shared")).unwrap();
}

pub fn cluster(name: &str) -> ClusterConfig {
    let mut cluster = ClusterConfig::new(Backend::Local, format!("local://{name}"));
    cluster.timeout = Duration::from_secs(30);
    cluster
}
