use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::DistErr;

/// The collective communication backend a process group runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Ranks are threads of the current process, collectives go through shared memory.
    #[default]
    Local,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
        }
    }
}

impl FromStr for Backend {
    type Err = DistErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Backend::Local),
            other => Err(DistErr::UnsupportedBackend(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_backends_only() {
        assert_eq!("local".parse::<Backend>().unwrap(), Backend::Local);
        assert!(matches!(
            "nccl".parse::<Backend>(),
            Err(DistErr::UnsupportedBackend(name)) if name == "nccl"
        ));
    }
}
