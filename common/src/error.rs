//! Error taxonomy shared by every stage of a run.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Everything that can go wrong inside a task.
#[derive(Debug, Error)]
pub enum Error {
    /// A record store could not be opened, created, scanned, written or merged.
    #[error("storage error on `{}`: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A fetch failed to connect, or the peer answered with a non-success status.
    #[error("network error fetching `{url}`: {reason}")]
    Network {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// A user map or reduce function reported failure.
    #[error("user function failed: {0:#}")]
    UserFunction(anyhow::Error),

    /// An expected store is absent, or records arrived out of key order.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn storage(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Storage {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Stable name of the error class, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage { .. } => "storage",
            Error::Network { .. } => "network",
            Error::UserFunction(_) => "user function",
            Error::Protocol(_) => "protocol",
        }
    }
}

/// Stage of a run that a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Split,
    Map,
    Reduce,
    Gather,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Split => "split",
            Phase::Map => "map",
            Phase::Reduce => "reduce",
            Phase::Gather => "gather",
        };
        f.write_str(name)
    }
}

/// A failure tagged with the task that produced it.
#[derive(Debug, Error)]
#[error("{phase} task {index} failed: {source}")]
pub struct TaskError {
    pub phase: Phase,
    pub index: usize,
    #[source]
    pub source: Error,
}

impl TaskError {
    pub fn new(phase: Phase, index: usize, source: Error) -> Self {
        Self {
            phase,
            index,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_names_phase_index_and_cause() {
        let err = TaskError::new(
            Phase::Reduce,
            3,
            Error::Protocol("store `map_0_output_3.db` is absent".into()),
        );
        assert_eq!(
            err.to_string(),
            "reduce task 3 failed: protocol error: store `map_0_output_3.db` is absent"
        );
        assert_eq!(err.source.kind(), "protocol");
    }

    #[test]
    fn user_function_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("bad count").context("parsing value");
        let err = Error::UserFunction(inner);
        assert_eq!(err.to_string(), "user function failed: parsing value: bad count");
    }
}
