//! Per-partition spill file with an in-memory coalescing cache.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::codec::{write_record, Datum};
use crate::Result;

/// Append-only spill state for one partition.
///
/// While the cache is active, writes coalesce into an ordered map keyed by
/// the full record, so flushing naturally emits sorted output. A write that
/// bypasses the cache (importers injecting records after a flush) clears the
/// `sorted` flag, and the file must then go through the sorter before it can
/// serve as a merge fragment.
pub(crate) struct PartitionWriter<K: Datum, V: Datum> {
    /// Current spill file, if one has been allocated.
    pub(crate) filename: Option<PathBuf>,
    /// Sorted fragment files owned by this partition, pending merge.
    pub(crate) fragments: Vec<PathBuf>,
    /// True iff every record so far went through the coalescing cache.
    pub(crate) sorted: bool,
    stream: Option<BufWriter<File>>,
    cache: BTreeMap<(K, V), u64>,
    cache_active: bool,
}

impl<K: Datum, V: Datum> PartitionWriter<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            filename: None,
            fragments: Vec::new(),
            sorted: true,
            stream: None,
            cache: BTreeMap::new(),
            cache_active: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Open (or reopen, truncating) the current spill file and activate the
    /// cache. `filename` must already be set.
    pub(crate) fn open(&mut self) -> Result<()> {
        assert!(self.cache.is_empty(), "open with undrained cache");
        let path = self.filename.as_ref().expect("open without a spill path");
        self.stream = Some(BufWriter::new(File::create(path)?));
        self.cache_active = true;
        Ok(())
    }

    /// Buffer one record. Cached writes coalesce; direct writes append a
    /// framed record and mark the file unsorted.
    pub(crate) fn write(&mut self, key: &K, value: &V) -> Result<()> {
        if self.cache_active {
            *self
                .cache
                .entry((key.clone(), value.clone()))
                .or_insert(0) += 1;
            return Ok(());
        }

        self.sorted = false;
        let stream = self.stream.as_mut().expect("write on closed stream");
        write_record(stream, key, value)
    }

    /// Drain the cache to disk in `(key, value)` order, emitting each record
    /// as many times as it was inserted. Subsequent writes bypass the cache.
    pub(crate) fn flush_cache(&mut self) -> Result<()> {
        self.cache_active = false;
        let stream = self.stream.as_mut().expect("flush on closed stream");
        for ((key, value), count) in std::mem::take(&mut self.cache) {
            for _ in 0..count {
                write_record(stream, &key, &value)?;
            }
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        if self.stream.is_some() {
            self.flush_cache()?;
            let mut stream = self.stream.take().unwrap();
            stream.flush()?;
        }
        Ok(())
    }

    /// Give up the current spill file, resetting the writer for reuse.
    pub(crate) fn take_file(&mut self) -> Option<PathBuf> {
        self.sorted = true;
        self.filename.take()
    }
}
