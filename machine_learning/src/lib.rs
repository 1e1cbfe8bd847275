pub mod amp;
pub mod arch;
pub mod error;
pub mod initialization;
pub mod optimization;
pub mod scheduler;
pub mod state_dict;

pub use error::{MlErr, Result};
pub use state_dict::{StateDict, Tensor};
