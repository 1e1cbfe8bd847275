use super::{Relu, Sigmoid};

/// Element-wise activation applied after a layer's affine map.
#[derive(Clone, Copy, Debug)]
pub enum ActFn {
    Sigmoid(Sigmoid),
    Relu(Relu),
}

impl ActFn {
    pub fn sigmoid() -> Self {
        ActFn::Sigmoid(Sigmoid)
    }

    pub fn relu() -> Self {
        ActFn::Relu(Relu)
    }

    pub fn f(&self, x: f32) -> f32 {
        match self {
            ActFn::Sigmoid(a) => a.f(x),
            ActFn::Relu(a) => a.f(x),
        }
    }

    pub fn df(&self, x: f32) -> f32 {
        match self {
            ActFn::Sigmoid(a) => a.df(x),
            ActFn::Relu(a) => a.df(x),
        }
    }
}
