//! File backed record store.
//!
//! A store is a plain file with one record per line. Key and value are
//! base64 (URL safe) encoded and separated by a single space, so any
//! string survives the trip and a truncated or corrupt line is detected
//! instead of being read as data.

use std::fs::{self, File, OpenOptions};
use std::io::{self, prelude::*, BufReader, BufWriter, Lines};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use ext_sort::{buffer::LimitedBufferBuilder, ExternalSorter, ExternalSorterBuilder};
use tracing::debug;

use crate::{Error, KeyValue};

/// Records held in memory by the external sorter before a chunk is spilled.
pub const SORT_BUFFER_RECORDS: usize = 100_000;

/// An open record store.
///
/// Writes are buffered; [`RecordStore::scan`], [`RecordStore::count`] and
/// [`RecordStore::close`] flush first, so they always see every inserted
/// record.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RecordStore {
    /// Create an empty store at `path`, replacing whatever was there.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| Error::storage(&path, e))?;
        debug!("created store {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Open an existing store. New records are appended.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| Error::storage(&path, e))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&mut self, kv: &KeyValue) -> Result<(), Error> {
        let line = encode_line(kv);
        self.writer
            .write_all(line.as_bytes())
            .map_err(|e| Error::storage(&self.path, e))
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer
            .flush()
            .map_err(|e| Error::storage(&self.path, e))
    }

    /// Iterate over every record, in insertion order.
    pub fn scan(&mut self) -> Result<Scan, Error> {
        self.flush()?;
        Scan::open(&self.path)
    }

    pub fn count(&mut self) -> Result<usize, Error> {
        self.flush()?;
        count(&self.path)
    }

    /// Append every record of the store at `other`. Returns how many were added.
    pub fn merge(&mut self, other: impl AsRef<Path>) -> Result<usize, Error> {
        let mut merged = 0;
        for record in Scan::open(other.as_ref())? {
            self.insert(&record?)?;
            merged += 1;
        }
        debug!(
            "merged {merged} records from {} into {}",
            other.as_ref().display(),
            self.path.display()
        );
        Ok(merged)
    }

    /// Visit every record in `(key, value)` order.
    ///
    /// Sorting is done by an external merge sort whose chunks are spilled to
    /// `spill_dir`, so the store never has to fit in memory. The sorter lives
    /// only for the duration of `f`.
    pub fn sorted<T, F>(&mut self, spill_dir: &Path, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut dyn Iterator<Item = Result<KeyValue, Error>>) -> Result<T, Error>,
    {
        let scan = self.scan()?;
        let path = self.path.clone();
        let sort_error = |e: String| Error::storage(&path, io::Error::other(e));

        let sorter: ExternalSorter<KeyValue, Error, LimitedBufferBuilder> =
            ExternalSorterBuilder::new()
                .with_tmp_dir(spill_dir)
                .with_buffer(LimitedBufferBuilder::new(SORT_BUFFER_RECORDS, false))
                .build()
                .map_err(|e| sort_error(e.to_string()))?;

        let sorted = sorter.sort(scan).map_err(|e| sort_error(e.to_string()))?;
        let mut sorted = sorted.map(|item| item.map_err(|e| sort_error(e.to_string())));

        f(&mut sorted)
    }

    /// Flush and release the store.
    pub fn close(mut self) -> Result<(), Error> {
        self.flush()?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::storage(&self.path, e))
    }
}

/// Iterate over the records of the store at `path` without opening it for writing.
pub fn scan(path: impl AsRef<Path>) -> Result<Scan, Error> {
    Scan::open(path.as_ref())
}

/// Number of records in the store at `path`.
pub fn count(path: impl AsRef<Path>) -> Result<usize, Error> {
    let mut count = 0;
    for record in scan(path)? {
        record?;
        count += 1;
    }
    Ok(count)
}

/// Remove the store at `path`.
pub fn delete(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    fs::remove_file(path).map_err(|e| Error::storage(path, e))
}

/// Remove the store at `path` if there is one. Used on cleanup paths,
/// where the first error is the one reported.
pub fn discard(path: impl AsRef<Path>) {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("could not remove {}: {e}", path.display()),
    }
}

/// Sequential reader over a store file.
#[derive(Debug)]
pub struct Scan {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl Scan {
    fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|e| Error::storage(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
        })
    }
}

impl Iterator for Scan {
    type Item = Result<KeyValue, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::storage(&self.path, e))),
            };
            if line.is_empty() {
                continue;
            }
            return Some(decode_line(&line).map_err(|e| Error::storage(&self.path, e)));
        }
    }
}

fn encode_line(kv: &KeyValue) -> String {
    format!("{} {}\n", URL_SAFE.encode(&kv.key), URL_SAFE.encode(&kv.value))
}

fn decode_line(line: &str) -> io::Result<KeyValue> {
    let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidData, format!("{what}: `{line}`"));

    let (key, value) = line
        .split_once(' ')
        .ok_or_else(|| invalid("record without separator"))?;
    let key = URL_SAFE.decode(key).map_err(|_| invalid("undecodable key"))?;
    let value = URL_SAFE
        .decode(value)
        .map_err(|_| invalid("undecodable value"))?;

    Ok(KeyValue {
        key: String::from_utf8(key).map_err(|_| invalid("key is not utf-8"))?,
        value: String::from_utf8(value).map_err(|_| invalid("value is not utf-8"))?,
    })
}
