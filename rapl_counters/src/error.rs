use std::{io, num::ParseIntError, path::PathBuf};

use thiserror::Error;

use crate::EnergyDomain;

#[derive(Debug, Error)]
pub enum EnergyError {
    /// The source cannot measure this domain at all.
    #[error("energy domain {domain} is not supported by source {source_name}")]
    UnsupportedDomain { source_name: String, domain: EnergyDomain },
}

/// Why the counter of a package could not be obtained.
#[derive(Debug, Error)]
pub enum UnavailableReading {
    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path:?}: '{content}'")]
    Parse {
        path: PathBuf,
        content: String,
        #[source]
        source: ParseIntError,
    },
}

impl UnavailableReading {
    pub fn path(&self) -> &PathBuf {
        match self {
            UnavailableReading::Read { path, .. } => path,
            UnavailableReading::Parse { path, .. } => path,
        }
    }
}
