//! Building a source store from plain files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use common::store::RecordStore;
use common::KeyValue;

/// Create a store at `target` with one record per file matching `pattern`:
/// the file path as key and its contents as value. Returns the record count.
pub fn load(pattern: &str, target: &Path) -> Result<usize> {
    let paths = glob::glob(pattern).with_context(|| format!("invalid pattern `{pattern}`"))?;

    let mut store = RecordStore::create(target)?;
    let mut loaded = 0;
    for path in paths {
        let path = path?;
        if !path.is_file() {
            continue;
        }
        let contents = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        debug!("loading {}", path.display());
        store.insert(&KeyValue::new(path.display().to_string(), contents))?;
        loaded += 1;
    }
    store.close()?;
    Ok(loaded)
}
