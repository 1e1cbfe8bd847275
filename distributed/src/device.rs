use std::cell::Cell;

use log::info;

thread_local! {
    static CURRENT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The compute device a rank is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    index: usize,
}

impl Device {
    /// Binds the calling thread to the device at `local_rank`.
    pub fn bind(local_rank: usize) -> Self {
        CURRENT.with(|current| current.set(Some(local_rank)));
        info!(device = local_rank; "bound to device");
        Self { index: local_rank }
    }

    /// The device the calling thread is bound to, if any.
    pub fn current() -> Option<Self> {
        CURRENT.with(|current| current.get()).map(|index| Self { index })
    }

    pub fn index(&self) -> usize {
        self.index
    }
}
