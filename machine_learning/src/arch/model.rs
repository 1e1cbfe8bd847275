use ndarray::{Array2, ArrayView2};

use crate::{Result, StateDict};

/// Whether a model records what it needs for a backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// A trainable model holding a flat parameter buffer and a gradient buffer of the same length.
pub trait Model: Send {
    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize;

    fn params(&self) -> &[f32];

    fn params_mut(&mut self) -> &mut [f32];

    fn grad(&self) -> &[f32];

    fn grad_mut(&mut self) -> &mut [f32];

    /// Splits the model into its mutable parameters and its current gradient, as needed by an
    /// optimizer step.
    fn params_and_grad(&mut self) -> (&mut [f32], &[f32]);

    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    fn zero_grad(&mut self) {
        self.grad_mut().fill(0.);
    }

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `x` - The input batch, one sample per row.
    ///
    /// # Returns
    /// The class scores for each sample, or an error if the input doesn't fit the model.
    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Propagates `d`, the derivative of the loss with respect to the last forward output,
    /// back through the network. The parameter gradients are **accumulated** into the gradient
    /// buffer.
    fn backward(&mut self, d: Array2<f32>) -> Result<()>;

    /// Exports the parameters as named tensors.
    fn state_dict(&self) -> StateDict;

    /// Overwrites the parameters from named tensors, every tensor must be present and well shaped.
    fn load_state_dict(&mut self, dict: &StateDict) -> Result<()>;
}
