use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::debug;

use super::{Dataset, Sample};
use crate::{Result, TrainErr};

/// An image folder: every sub-directory of the root is a class, every file in it a sample.
///
/// Classes are labeled by the sorted order of their directory names. A sample file holds
/// `side * side` little-endian `f32` pixels.
#[derive(Debug, Clone)]
pub struct FolderDataset {
    root: PathBuf,
    classes: Vec<String>,
    entries: Vec<(PathBuf, usize)>,
    side: usize,
}

impl FolderDataset {
    /// Indexes the folder at `root`.
    ///
    /// # Arguments
    /// * `root` - The folder holding one directory per class.
    /// * `side` - The side of the square samples.
    ///
    /// # Returns
    /// The indexed dataset, or an error if `root` is not a directory or holds no samples.
    pub fn open(root: &Path, side: usize) -> Result<Self> {
        if !root.is_dir() {
            return Err(TrainErr::MissingDirectory(root.to_path_buf()));
        }

        let mut class_dirs = sorted_entries(root)?;
        class_dirs.retain(|path| path.is_dir());

        let mut classes = Vec::with_capacity(class_dirs.len());
        let mut entries = Vec::new();

        for (label, dir) in class_dirs.iter().enumerate() {
            let name = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            classes.push(name);

            for file in sorted_entries(dir)? {
                if file.is_file() {
                    entries.push((file, label));
                }
            }
        }

        if entries.is_empty() {
            return Err(TrainErr::EmptyDataset(root.to_path_buf()));
        }

        debug!(classes = classes.len(), samples = entries.len(); "indexed {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            classes,
            entries,
            side,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Writes `pixels` as a sample file at `path`.
    pub fn write_sample(path: &Path, pixels: &[f32]) -> Result<()> {
        let words: Vec<u32> = pixels.iter().map(|p| p.to_bits().to_le()).collect();
        fs::write(path, bytemuck::cast_slice::<u32, u8>(&words))?;
        Ok(())
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;

    paths.sort();
    Ok(paths)
}

impl Dataset for FolderDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn num_classes(&self) -> usize {
        self.classes.len()
    }

    fn sample_len(&self) -> usize {
        self.side * self.side
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let Some((path, label)) = self.entries.get(index) else {
            return Err(TrainErr::Sample {
                path: self.root.clone(),
                reason: format!("index {index} is out of range for {} samples", self.len()),
            });
        };

        let bytes = fs::read(path)?;
        let expected = self.sample_len() * size_of::<f32>();

        if bytes.len() != expected {
            return Err(TrainErr::Sample {
                path: path.clone(),
                reason: format!("got {} bytes, expected {expected}", bytes.len()),
            });
        }

        let pixels = bytemuck::pod_collect_to_vec::<u8, u32>(&bytes)
            .into_iter()
            .map(|w| f32::from_bits(u32::from_le(w)))
            .collect();

        Ok(Sample {
            pixels,
            label: *label,
        })
    }
}
