use ndarray::{
    Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg,
};

use crate::{
    MlErr, Result,
    arch::{Mode, activations::ActFn},
};

/// A fully connected layer, `a = act_fn(x · W + b)`.
///
/// The layer doesn't own its parameters, they are lent to it as a slice of the model's flat
/// buffer on every pass: the first `dim.0 * dim.1` values are the row-major weights and the
/// remaining `dim.1` values are the biases.
#[derive(Clone, Debug)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    size: usize,

    // Forward metadata
    x: Option<Array2<f32>>,
    z: Option<Array2<f32>>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The input and output sizes of the layer.
    /// * `act_fn` - An optional activation function applied to the output.
    ///
    /// # Returns
    /// A new `Dense` instance.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self {
            dim,
            size: (dim.0 + 1) * dim.1,
            act_fn,
            x: None,
            z: None,
        }
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Computes this layer's output. In `Mode::Train` the input and the pre-activation are kept
    /// for the following `backward` call.
    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView2<f32>,
        mode: Mode,
    ) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                what: "dense layer input",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(params)?;
        let z = x.dot(&w) + &b;

        let a = match &self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        match mode {
            Mode::Train => {
                self.x = Some(x.to_owned());
                self.z = Some(z);
            }
            Mode::Eval => {
                self.x = None;
                self.z = None;
            }
        }

        Ok(a)
    }

    /// Accumulates this layer's parameter gradient into `grad` and returns the derivative of the
    /// loss with respect to the layer's input.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        mut d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        let x = self.x.take().ok_or(MlErr::BackwardBeforeForward)?;
        let z = self.z.take().ok_or(MlErr::BackwardBeforeForward)?;

        if d.dim() != z.dim() {
            return Err(MlErr::SizeMismatch {
                what: "dense layer delta",
                got: d.len(),
                expected: z.len(),
            });
        }

        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &x.t(), &d, 1.0, &mut dw);
        db += &d.sum_axis(Axis(0));

        let (w, _) = self.view_params(params)?;
        Ok(d.dot(&w.t()))
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        self.check_len(grad.len())?;

        let w_size = self.size - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw)?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        self.check_len(params.len())?;

        let w_size = self.size - self.dim.1;
        let weights = ArrayView2::from_shape(self.dim, &params[..w_size])?;
        let biases = ArrayView1::from_shape(self.dim.1, &params[w_size..])?;
        Ok((weights, biases))
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.size {
            return Err(MlErr::SizeMismatch {
                what: "dense layer parameters",
                got,
                expected: self.size,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn forward_is_affine_without_activation() {
        let mut dense = Dense::new((2, 1), None);
        let params = [2.0f32, 3.0, 1.0];

        let x = array![[1.0, 1.0], [0.0, 2.0]];
        let y = dense.forward(&params, x.view(), Mode::Eval).unwrap();

        assert_eq!(y, array![[6.0f32], [7.0]]);
    }

    #[test]
    fn backward_accumulates_gradient() {
        let mut dense = Dense::new((2, 1), None);
        let params = [2.0f32, 3.0, 1.0];
        let mut grad = [0.0f32; 3];

        let x = array![[1.0, 2.0]];
        dense.forward(&params, x.view(), Mode::Train).unwrap();
        let dx = dense.backward(&params, &mut grad, array![[1.0]]).unwrap();

        assert_eq!(grad, [1.0f32, 2.0, 1.0]);
        assert_eq!(dx, array![[2.0f32, 3.0]]);

        dense.forward(&params, x.view(), Mode::Train).unwrap();
        dense.backward(&params, &mut grad, array![[1.0]]).unwrap();
        assert_eq!(grad, [2.0f32, 4.0, 2.0]);
    }

    #[test]
    fn eval_forward_keeps_no_metadata() {
        let mut dense = Dense::new((1, 1), None);
        let params = [1.0f32, 0.0];
        let mut grad = [0.0f32; 2];

        dense.forward(&params, array![[1.0]].view(), Mode::Eval).unwrap();
        let err = dense.backward(&params, &mut grad, array![[1.0]]);

        assert!(matches!(err, Err(MlErr::BackwardBeforeForward)));
    }

    #[test]
    fn wrong_input_width_fails() {
        let mut dense = Dense::new((3, 1), None);
        let params = [0.0f32; 4];

        let err = dense.forward(&params, array![[1.0, 2.0]].view(), Mode::Train);
        assert!(matches!(err, Err(MlErr::SizeMismatch { .. })));
    }
}
