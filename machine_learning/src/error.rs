use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Shape(ShapeError),
    MissingTensor {
        name: String,
    },
    TensorShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    LabelOutOfRange {
        label: usize,
        classes: usize,
    },
    BackwardBeforeForward,
    InvalidDistribution(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::Shape(e) => write!(f, "invalid array shape: {e}"),
            MlErr::MissingTensor { name } => {
                write!(f, "the state dict has no tensor named {name}")
            }
            MlErr::TensorShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "tensor {name} has shape {got:?} but the model expects {expected:?}"
            ),
            MlErr::LabelOutOfRange { label, classes } => {
                write!(f, "label {label} is out of range for {classes} classes")
            }
            MlErr::BackwardBeforeForward => {
                write!(f, "backward was called without a preceding forward pass")
            }
            MlErr::InvalidDistribution(detail) => {
                write!(f, "invalid parameter distribution: {detail}")
            }
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}
