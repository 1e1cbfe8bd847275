use std::ops::Range;

use ndarray::{Array2, ArrayView2};
use rand::Rng;

use super::{Mode, Model, layers::Dense};
use crate::{MlErr, Result, StateDict, Tensor, initialization};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
///
/// Every layer's parameters live contiguously in one flat buffer, in layer order, so the whole
/// model can be synchronized or optimized as a single slice.
#[derive(Clone, Debug)]
pub struct Sequential {
    layers: Vec<Dense>,
    offsets: Vec<usize>,
    params: Vec<f32>,
    grad: Vec<f32>,
    mode: Mode,
}

impl Sequential {
    /// Creates a new `Sequential` with every parameter set to zero.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Dense>,
    {
        let layers: Vec<Dense> = layers.into_iter().collect();
        let mut offsets = Vec::with_capacity(layers.len());
        let mut size = 0;

        for layer in &layers {
            offsets.push(size);
            size += layer.size();
        }

        Self {
            layers,
            offsets,
            params: vec![0.; size],
            grad: vec![0.; size],
            mode: Mode::Train,
        }
    }

    /// Initializes the weights with Kaiming normal samples and the biases with zeros.
    ///
    /// # Arguments
    /// * `rng` - The random number generator to sample from.
    pub fn init<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        for (layer, &offset) in self.layers.iter().zip(&self.offsets) {
            let (n_in, n_out) = layer.dim();
            let w_size = n_in * n_out;
            let weights = initialization::kaiming(rng, w_size, n_in)?;

            let params = &mut self.params[offset..offset + layer.size()];
            let (w, b) = params.split_at_mut(w_size);
            w.copy_from_slice(&weights);
            b.fill(0.);
        }

        Ok(())
    }

    /// Returns the amount of inputs the first layer expects.
    pub fn input_size(&self) -> usize {
        self.layers.first().map(|l| l.dim().0).unwrap_or_default()
    }

    /// Returns the amount of outputs of the last layer.
    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.dim().1).unwrap_or_default()
    }

    /// Lists every named tensor of the model with its shape and its range in the flat buffer.
    fn entries(&self) -> Vec<(String, Vec<usize>, Range<usize>)> {
        let mut entries = Vec::with_capacity(self.layers.len() * 2);

        for (i, (layer, &offset)) in self.layers.iter().zip(&self.offsets).enumerate() {
            let (n_in, n_out) = layer.dim();
            let w_end = offset + n_in * n_out;

            entries.push((format!("layers.{i}.weight"), vec![n_in, n_out], offset..w_end));
            entries.push((format!("layers.{i}.bias"), vec![n_out], w_end..w_end + n_out));
        }

        entries
    }
}

impl Model for Sequential {
    fn size(&self) -> usize {
        self.params.len()
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn grad(&self) -> &[f32] {
        &self.grad
    }

    fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    fn params_and_grad(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grad)
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let mode = self.mode;
        let mut layers = self.layers.iter_mut().zip(&self.offsets);

        let Some((first, &offset)) = layers.next() else {
            return Ok(x.to_owned());
        };

        let mut a = first.forward(&self.params[offset..offset + first.size()], x, mode)?;

        for (layer, &offset) in layers {
            a = layer.forward(&self.params[offset..offset + layer.size()], a.view(), mode)?;
        }

        Ok(a)
    }

    fn backward(&mut self, mut d: Array2<f32>) -> Result<()> {
        for (layer, &offset) in self.layers.iter_mut().zip(&self.offsets).rev() {
            let range = offset..offset + layer.size();
            d = layer.backward(&self.params[range.clone()], &mut self.grad[range], d)?;
        }

        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        self.entries()
            .into_iter()
            .map(|(name, shape, range)| {
                let tensor = Tensor {
                    shape,
                    data: self.params[range].to_vec(),
                };
                (name, tensor)
            })
            .collect()
    }

    fn load_state_dict(&mut self, dict: &StateDict) -> Result<()> {
        let entries = self.entries();

        // Validate everything first so a bad dict leaves the parameters untouched.
        for (name, shape, _) in &entries {
            let tensor = dict
                .get(name)
                .ok_or_else(|| MlErr::MissingTensor { name: name.clone() })?;

            if &tensor.shape != shape || tensor.data.len() != shape.iter().product::<usize>() {
                return Err(MlErr::TensorShapeMismatch {
                    name: name.clone(),
                    got: tensor.shape.clone(),
                    expected: shape.clone(),
                });
            }
        }

        for (name, _, range) in entries {
            self.params[range].copy_from_slice(&dict[&name].data);
        }

        Ok(())
    }
}
