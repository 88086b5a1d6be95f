//! The partition store: top-level container for intermediate results.
//!
//! One store serves one map worker. Inserted records are routed by the
//! partitioner into per-partition spill writers, coalesced in memory, and
//! flushed to disk sorted. Stores exchange data through `merge_from`, which
//! adopts a peer's files as sorted fragments; `shuffle` collapses a
//! partition's fragments into a single sorted file that `reduce` then sweeps
//! group by group. All spill files live in a `SpillDir` that disappears with
//! the store.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::codec::{Datum, RecordReader};
use crate::merger::FragmentMerger;
use crate::sorter::ExternalFileSorter;
use crate::temp::SpillDir;
use crate::writer::PartitionWriter;
use crate::{
    Combiner, Error, FileMerger, FileSorter, HashPartitioner, Partitioner, RecordSink, Result,
};

fn remove_file_logged(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("failed to delete temp file {}: {e}", path.display());
        }
    }
}

/// Move a file, copying and deleting when a plain rename is not possible
/// (two stores' spill dirs can sit on different filesystems).
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if let Err(e) = std::fs::copy(from, to) {
        remove_file_logged(to);
        return Err(e.into());
    }
    remove_file_logged(from);
    Ok(())
}

pub struct PartitionStore<K, V, P = HashPartitioner, S = ExternalFileSorter, M = FragmentMerger>
where
    K: Datum,
    V: Datum,
{
    num_partitions: usize,
    writers: BTreeMap<usize, PartitionWriter<K, V>>,
    partitioner: P,
    sorter: S,
    merger: M,
    spill_dir: SpillDir,
}

impl<K: Datum, V: Datum> PartitionStore<K, V> {
    /// Create a store with the default partitioner, sorter and merger,
    /// spilling under the platform temp directory.
    pub fn new(num_partitions: usize) -> Result<Self> {
        Ok(Self::with_functors(
            num_partitions,
            SpillDir::new()?,
            HashPartitioner,
            ExternalFileSorter::default(),
            FragmentMerger::default(),
        ))
    }

    /// As `new`, but spilling under `base_dir`.
    pub fn new_in(num_partitions: usize, base_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_functors(
            num_partitions,
            SpillDir::in_dir(base_dir)?,
            HashPartitioner,
            ExternalFileSorter::default(),
            FragmentMerger::default(),
        ))
    }
}

impl<K, V, P, S, M> PartitionStore<K, V, P, S, M>
where
    K: Datum,
    V: Datum,
    P: Partitioner<K>,
    S: FileSorter<K, V>,
    M: FileMerger<K, V>,
{
    pub fn with_functors(
        num_partitions: usize,
        spill_dir: SpillDir,
        partitioner: P,
        sorter: S,
        merger: M,
    ) -> Self {
        assert!(num_partitions >= 1, "store needs at least one partition");
        Self {
            num_partitions,
            writers: BTreeMap::new(),
            partitioner,
            sorter,
            merger,
            spill_dir,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Indices of partitions that have received records.
    pub fn partitions(&self) -> impl Iterator<Item = usize> + '_ {
        self.writers.keys().copied()
    }

    /// Route a record to its partition and buffer it through the writer's
    /// coalescing cache. Records whose key encodes to zero bytes are the
    /// "no current group" sentinel and are dropped.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let mut encoded = Vec::new();
        key.encode(&mut encoded);
        if encoded.is_empty() {
            debug!("dropping record with empty key");
            return Ok(());
        }

        let partition = self.partitioner.partition(&key, self.num_partitions);
        assert!(
            partition < self.num_partitions,
            "partitioner returned {partition} for {} partitions",
            self.num_partitions
        );

        let writer = self
            .writers
            .entry(partition)
            .or_insert_with(PartitionWriter::new);
        if writer.filename.is_none() {
            writer.filename = Some(self.spill_dir.fresh_path());
        }
        if !writer.is_open() {
            writer.open()?;
        }
        writer.write(&key, &value)
    }

    /// As `insert`, additionally forwarding the record to `sink` first.
    pub fn insert_with_sink(
        &mut self,
        key: K,
        value: V,
        sink: &mut impl RecordSink<K, V>,
    ) -> Result<()> {
        sink.accept(&key, &value)?;
        self.insert(key, value)
    }

    /// Adopt all intermediate files of `other`, partition by partition.
    /// Every adopted file is physically moved into the receiver's spill dir
    /// (the peer's dir vanishes when the peer is dropped); a sorted peer
    /// file moves as-is, an unsorted one is sorted straight into the
    /// receiver's dir. Each partition is all-or-nothing: bookkeeping on
    /// either side changes only after every file has landed, and on failure
    /// staged files are returned, leaving the peer intact.
    pub fn merge_from(&mut self, other: &mut Self) -> Result<()> {
        assert_eq!(
            self.num_partitions, other.num_partitions,
            "merge_from between stores with different partition counts"
        );

        for partition in 0..self.num_partitions {
            let Some(peer) = other.writers.get_mut(&partition) else {
                continue;
            };
            peer.close()?;

            let adopted = self.stage_adoption(peer)?;

            peer.fragments.clear();
            let _ = peer.take_file();
            let recv = self
                .writers
                .entry(partition)
                .or_insert_with(PartitionWriter::new);
            recv.fragments.extend(adopted);
        }
        Ok(())
    }

    /// Bring one peer partition's files into our spill dir and return their
    /// new paths, touching no bookkeeping on either side. On error, files
    /// already moved are moved back so the peer still owns everything.
    fn stage_adoption(&self, peer: &PartitionWriter<K, V>) -> Result<Vec<PathBuf>> {
        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut adopted: Vec<PathBuf> = Vec::new();
        let mut error: Option<Error> = None;

        for path in &peer.fragments {
            let dest = self.spill_dir.fresh_path();
            match move_file(path, &dest) {
                Ok(()) => {
                    moved.push((path.clone(), dest.clone()));
                    adopted.push(dest);
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        if error.is_none() {
            if let Some(path) = &peer.filename {
                let dest = self.spill_dir.fresh_path();
                if peer.sorted {
                    match move_file(path, &dest) {
                        Ok(()) => {
                            moved.push((path.clone(), dest.clone()));
                            adopted.push(dest);
                        }
                        Err(e) => error = Some(e),
                    }
                } else {
                    match self.sorter.sort(path, &dest) {
                        Ok(()) => {
                            remove_file_logged(path);
                            adopted.push(dest);
                        }
                        Err(e) => {
                            remove_file_logged(&dest);
                            error = Some(e);
                        }
                    }
                }
            }
        }

        if let Some(e) = error {
            for (from, to) in moved {
                if let Err(undo) = move_file(&to, &from) {
                    warn!(
                        "failed to return {} to {}: {undo}",
                        to.display(),
                        from.display()
                    );
                }
            }
            return Err(e);
        }
        Ok(adopted)
    }

    /// Collapse the partition's fragments into one sorted file. The
    /// partition's own spill file joins the merge so no records are left
    /// behind. A partition without fragments already has a single file and
    /// this is a no-op, which also makes repeated shuffles harmless.
    pub fn shuffle(&mut self, partition: usize) -> Result<()> {
        let writer = self
            .writers
            .get_mut(&partition)
            .expect("shuffle on unknown partition");
        writer.close()?;
        if writer.fragments.is_empty() {
            return Ok(());
        }
        debug!(
            "shuffling partition {partition}: {} fragments",
            writer.fragments.len()
        );

        let mut inputs = std::mem::take(&mut writer.fragments);
        let own_sorted = writer.sorted;
        if let Some(path) = writer.take_file() {
            if own_sorted {
                inputs.push(path);
            } else {
                let sorted_path = self.spill_dir.fresh_path();
                if let Err(e) = self.sorter.sort(&path, &sorted_path) {
                    let writer = self.writers.get_mut(&partition).unwrap();
                    writer.filename = Some(path);
                    writer.sorted = false;
                    writer.fragments = inputs;
                    return Err(e);
                }
                remove_file_logged(&path);
                inputs.push(sorted_path);
            }
        }

        let dest = self.spill_dir.fresh_path();
        self.merger.merge(&inputs, &dest)?;
        let writer = self.writers.get_mut(&partition).unwrap();
        writer.filename = Some(dest);
        writer.sorted = true;
        Ok(())
    }

    /// Bring the partition down to a single sorted file (or nothing).
    fn normalize(&mut self, partition: usize) -> Result<()> {
        self.shuffle(partition)?;
        let writer = self.writers.get_mut(&partition).unwrap();
        if writer.sorted || writer.filename.is_none() {
            return Ok(());
        }

        let infile = writer.take_file().unwrap();
        let sorted_path = self.spill_dir.fresh_path();
        if let Err(e) = self.sorter.sort(&infile, &sorted_path) {
            let writer = self.writers.get_mut(&partition).unwrap();
            writer.filename = Some(infile);
            writer.sorted = false;
            return Err(e);
        }
        remove_file_logged(&infile);
        let writer = self.writers.get_mut(&partition).unwrap();
        writer.filename = Some(sorted_path);
        Ok(())
    }

    /// Run a combiner over every partition. Each partition is sorted, swept
    /// in key order, and its groups fed through `start`/`add`/`finish`; the
    /// records `finish` pushes back through the sink replace the swept file.
    /// The explicit `NullCombiner` only closes writers.
    pub fn combine<C: Combiner<K, V>>(&mut self, combiner: &mut C) -> Result<()> {
        if C::IS_NULL {
            return self.close_all();
        }
        self.close_all()?;

        let partitions: Vec<usize> = self.writers.keys().copied().collect();
        for partition in partitions {
            self.normalize(partition)?;
            let writer = self.writers.get_mut(&partition).unwrap();
            let Some(path) = writer.take_file() else {
                continue;
            };
            debug!("combining partition {partition}");

            let mut reader = RecordReader::<K, V>::open(&path)?;
            let mut last_key: Option<K> = None;
            while let Some((key, value)) = reader.next_record()? {
                if last_key.as_ref() != Some(&key) {
                    if let Some(prev) = last_key.take() {
                        combiner.finish(&prev, self)?;
                    }
                    combiner.start(&key);
                    last_key = Some(key);
                }
                combiner.add(value);
            }
            if let Some(prev) = last_key {
                combiner.finish(&prev, self)?;
            }
            drop(reader);
            remove_file_logged(&path);
        }

        self.close_all()
    }

    /// Sweep the partition's sorted file, invoking `callback` once per
    /// maximal run of equal keys with the group's values. The partition is
    /// consumed: its writer is dismissed and its file deleted.
    pub fn reduce<F>(&mut self, partition: usize, mut callback: F) -> Result<()>
    where
        F: FnMut(&K, &[V]),
    {
        assert!(
            self.writers.contains_key(&partition),
            "reduce on unknown partition {partition}"
        );
        debug!("reducing partition {partition}");
        self.normalize(partition)?;

        let mut writer = self.writers.remove(&partition).unwrap();
        let Some(path) = writer.take_file() else {
            return Ok(());
        };

        let mut reader = RecordReader::<K, V>::open(&path)?;
        let mut last_key: Option<K> = None;
        let mut values: Vec<V> = Vec::new();
        while let Some((key, value)) = reader.next_record()? {
            if last_key.as_ref() != Some(&key) {
                if let Some(prev) = last_key.take() {
                    callback(&prev, &values);
                    values.clear();
                }
                last_key = Some(key);
            }
            values.push(value);
        }
        if let Some(prev) = last_key {
            callback(&prev, &values);
        }
        drop(reader);
        remove_file_logged(&path);
        Ok(())
    }

    /// A forward, single-pass iterator over every partition's records in
    /// globally ascending `(key, value)` order. Partitions are normalized
    /// (fragments merged, unsorted spills sorted) before reading starts.
    pub fn results(&mut self) -> Result<ResultIter<K, V>> {
        let partitions: Vec<usize> = self.writers.keys().copied().collect();
        for partition in partitions {
            self.normalize(partition)?;
        }

        let mut frontier = Vec::with_capacity(self.num_partitions);
        for partition in 0..self.num_partitions {
            let entry = match self.writers.get(&partition).and_then(|w| w.filename.as_ref()) {
                Some(path) => {
                    let mut reader = RecordReader::open(path)?;
                    reader.next_record()?.map(|record| (reader, record))
                }
                None => None,
            };
            frontier.push(entry);
        }
        Ok(ResultIter { frontier })
    }

    fn close_all(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.close()?;
        }
        Ok(())
    }
}

impl<K, V, P, S, M> RecordSink<K, V> for PartitionStore<K, V, P, S, M>
where
    K: Datum,
    V: Datum,
    P: Partitioner<K>,
    S: FileSorter<K, V>,
    M: FileMerger<K, V>,
{
    fn accept(&mut self, key: &K, value: &V) -> Result<()> {
        self.insert(key.clone(), value.clone())
    }
}

impl<K, V, P, S, M> Drop for PartitionStore<K, V, P, S, M>
where
    K: Datum,
    V: Datum,
{
    fn drop(&mut self) {
        for writer in self.writers.values_mut() {
            if let Err(e) = writer.close() {
                warn!("failed to close spill stream: {e}");
            }
            if let Some(path) = writer.take_file() {
                remove_file_logged(&path);
            }
            for path in std::mem::take(&mut writer.fragments) {
                remove_file_logged(&path);
            }
        }
    }
}

/// Live merge over the per-partition frontier: each `next` yields the
/// smallest current record and refills from the stream it came from.
pub struct ResultIter<K, V> {
    frontier: Vec<Option<(RecordReader<K, V>, (K, V))>>,
}

impl<K: Datum, V: Datum> Iterator for ResultIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let min = self
            .frontier
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| entry.as_ref().map(|(_, record)| (idx, record)))
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(idx, _)| idx)?;

        let (mut reader, record) = self.frontier[min].take().unwrap();
        match reader.next_record() {
            Ok(Some(next)) => self.frontier[min] = Some((reader, next)),
            Ok(None) => {}
            Err(e) => warn!("result stream ended with error: {e}"),
        }
        Some(record)
    }
}
