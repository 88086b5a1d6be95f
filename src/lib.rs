// Partitioned intermediate key/value store for a single-host MapReduce runtime.
//
// Map tasks insert records into a `PartitionStore`; the store partitions and
// coalesces them in memory, spills them to disk as sorted fragments, merges
// fragments imported from peer stores, and finally hands each partition to a
// reduce callback as an ordered stream of records.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Routes a key to one of `num_partitions` buckets. Must be pure and
/// deterministic: peer stores rely on identical keys landing in identical
/// partition indices when their contents are merged.
pub trait Partitioner<K> {
    fn partition(&self, key: &K, num_partitions: usize) -> usize;
}

/// Default partitioner: hashes the key's encoded bytes with a fixed-seed
/// hasher, so the mapping is stable across stores and processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashPartitioner;

impl<K: Datum> Partitioner<K> for HashPartitioner {
    fn partition(&self, key: &K, num_partitions: usize) -> usize {
        use std::hash::Hasher;

        let mut bytes = Vec::new();
        key.encode(&mut bytes);
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hasher.write(&bytes);
        (hasher.finish() % num_partitions as u64) as usize
    }
}

/// Rewrites an unsorted framed spill file as a sorted one. The input file is
/// left in place; the caller deletes it after a successful sort.
pub trait FileSorter<K, V> {
    fn sort(&self, input: &Path, output: &Path) -> Result<()>;
}

/// K-way merges sorted framed fragment files into `dest`, consuming (and
/// deleting) every input file on success.
pub trait FileMerger<K, V> {
    fn merge(&self, inputs: &[PathBuf], dest: &Path) -> Result<()>;
}

/// Receives records one at a time. Implemented by the store itself (records
/// are re-inserted) and by result sinks such as `ReduceFileOutput`.
pub trait RecordSink<K, V> {
    fn accept(&mut self, key: &K, value: &V) -> Result<()>;
}

/// An associative reducer applied opportunistically before the final reduce.
///
/// For each maximal run of equal keys in a sorted partition file the store
/// calls `start(key)`, then `add(value)` per record, then `finish(key, sink)`.
/// `finish` may push any number of records back through the sink.
pub trait Combiner<K, V> {
    /// The explicit no-op combiner sets this; `PartitionStore::combine` then
    /// skips the sweep entirely and only closes writers.
    const IS_NULL: bool = false;

    fn start(&mut self, key: &K);
    fn add(&mut self, value: V);
    fn finish(&mut self, key: &K, sink: &mut dyn RecordSink<K, V>) -> Result<()>;
}

/// Combiner that combines nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCombiner;

impl<K, V> Combiner<K, V> for NullCombiner {
    const IS_NULL: bool = true;

    fn start(&mut self, _key: &K) {}

    fn add(&mut self, _value: V) {}

    fn finish(&mut self, _key: &K, _sink: &mut dyn RecordSink<K, V>) -> Result<()> {
        Ok(())
    }
}

pub mod codec;
pub mod merger;
pub mod output;
pub mod sorter;
pub mod store;
pub mod temp;
mod writer;

pub use codec::{write_record, Datum, RecordReader};
pub use merger::FragmentMerger;
pub use output::ReduceFileOutput;
pub use sorter::ExternalFileSorter;
pub use store::{PartitionStore, ResultIter};
pub use temp::SpillDir;
