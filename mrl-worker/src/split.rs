//! Cutting a source store into map shards.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use common::store::{self, RecordStore};
use common::Error;

/// Deal the records of `source` round-robin into one new store per path.
///
/// Returns the record count of every shard. On failure every shard created
/// by this call is removed again.
pub fn split(source: &Path, paths: &[PathBuf]) -> Result<Vec<usize>, Error> {
    if paths.is_empty() {
        return Err(Error::Protocol("cannot split into zero shards".into()));
    }

    let mut created = 0;
    let result = split_into(source, paths, &mut created);
    match &result {
        Ok(counts) => info!(
            "split {} records of {} into {} shards",
            counts.iter().sum::<usize>(),
            source.display(),
            paths.len()
        ),
        Err(e) => {
            error!("splitting {} failed: {e}", source.display());
            paths[..created].iter().for_each(store::discard);
        }
    }
    result
}

fn split_into(source: &Path, paths: &[PathBuf], created: &mut usize) -> Result<Vec<usize>, Error> {
    let records = store::scan(source)?;

    let mut shards = Vec::with_capacity(paths.len());
    for path in paths {
        shards.push(RecordStore::create(path)?);
        *created += 1;
    }

    let mut counts = vec![0; paths.len()];
    for (i, record) in records.enumerate() {
        let shard = i % shards.len();
        shards[shard].insert(&record?)?;
        counts[shard] += 1;
    }

    for shard in shards {
        shard.close()?;
    }
    Ok(counts)
}
