use std::{error::Error, fmt, io, time::Duration};

/// The distributed module's result type.
pub type Result<T> = std::result::Result<T, DistErr>;

/// Process group failures.
#[derive(Debug)]
pub enum DistErr {
    Io(io::Error),
    UnsupportedUrl(String),
    UnsupportedBackend(String),
    InvalidRank {
        rank: usize,
        world_size: usize,
    },
    WorldSizeMismatch {
        url: String,
        got: usize,
        expected: usize,
    },
    DuplicateRank {
        rank: usize,
    },
    RendezvousTimeout {
        joined: usize,
        world_size: usize,
        timeout: Duration,
    },
    BufferLengthMismatch {
        got: usize,
        expected: usize,
    },
    CollectiveTimeout {
        arrived: usize,
        world_size: usize,
        timeout: Duration,
    },
    PeerLeft {
        rank: usize,
    },
}

impl fmt::Display for DistErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistErr::Io(e) => write!(f, "io error: {e}"),
            DistErr::UnsupportedUrl(url) => write!(f, "unsupported rendezvous url: {url}"),
            DistErr::UnsupportedBackend(name) => write!(f, "unsupported backend: {name}"),
            DistErr::InvalidRank { rank, world_size } => {
                write!(f, "rank {rank} is out of range for a world of {world_size}")
            }
            DistErr::WorldSizeMismatch { url, got, expected } => write!(
                f,
                "rendezvous {url} expects a world of {expected}, got {got}"
            ),
            DistErr::DuplicateRank { rank } => write!(f, "rank {rank} joined twice"),
            DistErr::RendezvousTimeout {
                joined,
                world_size,
                timeout,
            } => write!(
                f,
                "only {joined} of {world_size} ranks joined within {timeout:?}"
            ),
            DistErr::BufferLengthMismatch { got, expected } => write!(
                f,
                "all-reduce buffer length mismatch: got {got}, expected {expected}"
            ),
            DistErr::CollectiveTimeout {
                arrived,
                world_size,
                timeout,
            } => write!(
                f,
                "only {arrived} of {world_size} ranks reached the collective within {timeout:?}"
            ),
            DistErr::PeerLeft { rank } => write!(f, "rank {rank} left the process group"),
        }
    }
}

impl Error for DistErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DistErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DistErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
