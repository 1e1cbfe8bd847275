use std::collections::BTreeMap;

use crate::{MlErr, Result};

/// A named, dense `f32` tensor detached from any live module.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Creates a new `Tensor`.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The row-major values, its length must be the product of `shape`.
    ///
    /// # Returns
    /// A new `Tensor` or an error if the data does not fill the shape exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = shape.iter().product();

        if data.len() != expected {
            return Err(MlErr::SizeMismatch {
                what: "tensor data",
                got: data.len(),
                expected,
            });
        }

        Ok(Self { shape, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The serializable image of a module: tensor name to tensor, in name order.
pub type StateDict = BTreeMap<String, Tensor>;
