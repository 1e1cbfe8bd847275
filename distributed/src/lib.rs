mod backend;
mod device;
mod error;
mod group;
mod local;
mod rendezvous;

use std::time::Duration;

pub use backend::Backend;
pub use device::Device;
pub use error::{DistErr, Result};
pub use group::ProcessGroup;
pub use local::LocalGroup;
pub use rendezvous::Rendezvous;

/// Joins the process group identified by `url`.
///
/// Blocks until all `world_size` ranks have joined or `timeout` elapses.
///
/// # Arguments
/// * `backend` - The communication backend of the group.
/// * `url` - The rendezvous url, either `file://<path>` or `local://<name>`.
/// * `world_size` - The total amount of ranks of the group.
/// * `rank` - The rank of the caller within the group.
/// * `timeout` - How long to wait for the rest of the ranks.
///
/// # Returns
/// A handle to the joined group or an error if the rendezvous could not be established.
pub fn init_process_group(
    backend: Backend,
    url: &str,
    world_size: usize,
    rank: usize,
    timeout: Duration,
) -> Result<Box<dyn ProcessGroup>> {
    let rendezvous = Rendezvous::parse(url)?;

    match backend {
        Backend::Local => {
            let group = LocalGroup::join(&rendezvous, world_size, rank, timeout)?;
            Ok(Box::new(group))
        }
    }
}
