mod gradient_descent;
mod optimizer;
mod sgd;

pub use gradient_descent::GradientDescent;
pub use optimizer::Optimizer;
pub use sgd::{Sgd, SgdHyper, SgdState};
