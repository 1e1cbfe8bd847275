use std::path::PathBuf;

use crate::{DistErr, Result};

/// Where the ranks of a group meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendezvous {
    /// A shared file every rank registers in.
    File(PathBuf),
    /// A name only meaningful inside the current process.
    Local(String),
}

impl Rendezvous {
    /// Parses a rendezvous url of the form `file://<path>` or `local://<name>`.
    pub fn parse(url: &str) -> Result<Self> {
        match (url.strip_prefix("file://"), url.strip_prefix("local://")) {
            (Some(path), _) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
            (_, Some(name)) if !name.is_empty() => Ok(Self::Local(name.to_string())),
            _ => Err(DistErr::UnsupportedUrl(url.to_string())),
        }
    }

    /// The key ranks of the same group agree on.
    pub fn key(&self) -> String {
        match self {
            Rendezvous::File(path) => format!("file://{}", path.display()),
            Rendezvous::Local(name) => format!("local://{name}"),
        }
    }
}
