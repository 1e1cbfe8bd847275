use crate::Result;

/// A joined group of cooperating ranks.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Blocks until every rank of the group has reached this point.
    fn barrier(&self) -> Result<()>;

    /// Replaces `buf` with the element-wise mean of every rank's `buf`.
    ///
    /// Blocks until every rank has contributed.
    ///
    /// # Returns
    /// An error on every rank if the ranks' buffers differ in length.
    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()>;
}
