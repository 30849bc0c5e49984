//! Combining several stores into one.
//!
//! Used to assemble a reduce task's input from every map task's partition
//! and to gather the reduce outputs into the final result.

use std::path::{Path, PathBuf};

use tracing::{debug, error};

use common::store::{self, RecordStore};
use common::Error;

use crate::core::blocking;
use crate::exchange::Fetcher;

/// A store to merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRef {
    /// A store on this worker.
    Local(PathBuf),

    /// A store published by another worker. It is downloaded to `temp`
    /// first and `temp` is removed once merged.
    Remote { url: String, temp: PathBuf },
}

/// Sources ready to be combined: every remote store has been downloaded.
#[derive(Debug, Default)]
pub struct Staged {
    paths: Vec<PathBuf>,
    temps: Vec<PathBuf>,
}

impl Staged {
    fn discard(&self) {
        self.temps.iter().for_each(store::discard);
    }
}

/// Download every remote source.
///
/// A source answering 404 is reported as a protocol error: the store was
/// expected to exist. On failure, copies already downloaded are removed.
pub async fn fetch_sources(fetcher: &Fetcher, sources: &[StoreRef]) -> Result<Staged, Error> {
    let mut staged = Staged::default();
    for source in sources {
        match source {
            StoreRef::Local(path) => staged.paths.push(path.clone()),
            StoreRef::Remote { url, temp } => {
                if let Err(e) = fetcher.fetch(url, temp).await {
                    staged.discard();
                    return Err(match e {
                        Error::Network {
                            url,
                            status: Some(404),
                            ..
                        } => Error::Protocol(format!("expected store `{url}` is absent")),
                        e => e,
                    });
                }
                staged.paths.push(temp.clone());
                staged.temps.push(temp.clone());
            }
        }
    }
    Ok(staged)
}

/// Write the union of every staged source into a new store at `destination`.
///
/// Downloaded copies are removed whether or not this succeeds; on failure
/// the destination is removed too.
pub fn combine(staged: Staged, destination: &Path) -> Result<usize, Error> {
    let result = combine_into(&staged.paths, destination);
    staged.discard();
    match &result {
        Ok(count) => debug!(
            "merged {} stores ({count} records) into {}",
            staged.paths.len(),
            destination.display()
        ),
        Err(e) => {
            error!("merging into {} failed: {e}", destination.display());
            store::discard(destination);
        }
    }
    result
}

fn combine_into(paths: &[PathBuf], destination: &Path) -> Result<usize, Error> {
    let mut output = RecordStore::create(destination)?;
    let mut count = 0;
    for path in paths {
        count += output.merge(path)?;
    }
    output.close()?;
    Ok(count)
}

/// Merge `sources` into a new store at `destination`, fetching remote
/// sources first. Returns the number of records merged.
///
/// Either the destination holds the exact union of all sources, or it does
/// not exist and an error is returned.
pub async fn merge(fetcher: &Fetcher, sources: &[StoreRef], destination: &Path) -> Result<usize, Error> {
    let staged = fetch_sources(fetcher, sources).await?;
    let destination = destination.to_path_buf();
    blocking(move || combine(staged, &destination)).await
}
