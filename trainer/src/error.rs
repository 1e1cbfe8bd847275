use std::{error::Error, fmt, io, path::PathBuf};

use distributed::DistErr;
use machine_learning::MlErr;

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training job failures.
#[derive(Debug)]
pub enum TrainErr {
    Io(io::Error),
    Ml(MlErr),
    /// A collective operation failed after the group was formed.
    Dist(DistErr),
    /// The process group could not be joined.
    ProcessGroup(DistErr),
    MissingDirectory(PathBuf),
    InvalidConfig(String),
    EmptyDataset(PathBuf),
    Sample {
        path: PathBuf,
        reason: String,
    },
    Checkpoint {
        path: PathBuf,
        reason: String,
    },
    Json(serde_json::Error),
}

impl TrainErr {
    /// Whether the process must abort instead of reporting a failed job.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TrainErr::ProcessGroup(_) | TrainErr::MissingDirectory(_) | TrainErr::InvalidConfig(_)
        )
    }

    pub(crate) fn checkpoint(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Checkpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Ml(e) => write!(f, "model error: {e}"),
            TrainErr::Dist(e) => write!(f, "collective failed: {e}"),
            TrainErr::ProcessGroup(e) => write!(f, "failed to join the process group: {e}"),
            TrainErr::MissingDirectory(path) => {
                write!(f, "no such directory: {}", path.display())
            }
            TrainErr::InvalidConfig(reason) => write!(f, "invalid config: {reason}"),
            TrainErr::EmptyDataset(path) => write!(f, "no samples found in {}", path.display()),
            TrainErr::Sample { path, reason } => {
                write!(f, "bad sample {}: {reason}", path.display())
            }
            TrainErr::Checkpoint { path, reason } => {
                write!(f, "bad checkpoint {}: {reason}", path.display())
            }
            TrainErr::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Io(e) => Some(e),
            TrainErr::Ml(e) => Some(e),
            TrainErr::Dist(e) | TrainErr::ProcessGroup(e) => Some(e),
            TrainErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for TrainErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<DistErr> for TrainErr {
    fn from(value: DistErr) -> Self {
        Self::Dist(value)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn startup_failures_are_fatal() {
        let join = DistErr::RendezvousTimeout {
            joined: 1,
            world_size: 2,
            timeout: Duration::from_secs(1),
        };

        assert!(TrainErr::ProcessGroup(join).is_fatal());
        assert!(TrainErr::MissingDirectory("/nope".into()).is_fatal());
        assert!(!TrainErr::Dist(DistErr::BufferLengthMismatch { got: 1, expected: 2 }).is_fatal());
        assert!(!TrainErr::checkpoint("/x", "truncated").is_fatal());
    }
}
