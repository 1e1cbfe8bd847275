mod cross_entropy;
mod loss_fn;

pub use cross_entropy::{CrossEntropy, top1_correct};
pub use loss_fn::LossFn;
