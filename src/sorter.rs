//! External sort of a framed spill file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::codec::{write_record, Datum, RecordReader};
use crate::merger::FragmentMerger;
use crate::{FileMerger, FileSorter, Result};

/// Sorts a spill file by `(key, value)`. Input that fits in one chunk is
/// sorted in memory and written straight to the output; larger input is cut
/// into sorted runs that a `FragmentMerger` then collapses.
pub struct ExternalFileSorter {
    chunk_records: usize,
}

impl ExternalFileSorter {
    pub fn new(chunk_records: usize) -> Self {
        assert!(chunk_records >= 1, "chunk must hold at least one record");
        Self { chunk_records }
    }
}

impl Default for ExternalFileSorter {
    fn default() -> Self {
        Self::new(1 << 20)
    }
}

fn write_run<K: Datum, V: Datum>(path: &Path, records: &[(K, V)]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for (key, value) in records {
        write_record(&mut out, key, value)?;
    }
    out.flush()?;
    Ok(())
}

impl<K: Datum, V: Datum> FileSorter<K, V> for ExternalFileSorter {
    fn sort(&self, input: &Path, output: &Path) -> Result<()> {
        let mut reader = RecordReader::<K, V>::open(input)?;
        let mut chunk: Vec<(K, V)> = Vec::new();
        let mut runs: Vec<PathBuf> = Vec::new();

        loop {
            let record = reader.next_record()?;
            let at_end = record.is_none();
            if let Some(record) = record {
                chunk.push(record);
            }

            if at_end || chunk.len() >= self.chunk_records {
                chunk.sort();
                if at_end && runs.is_empty() {
                    // Single chunk: no merge pass needed.
                    return write_run(output, &chunk);
                }
                if !chunk.is_empty() {
                    let run_path = output.with_extension(format!("run{}", runs.len()));
                    write_run(&run_path, &chunk)?;
                    runs.push(run_path);
                    chunk.clear();
                }
                if at_end {
                    break;
                }
            }
        }

        debug!("external sort: merging {} runs into {}", runs.len(), output.display());
        FileMerger::<K, V>::merge(&FragmentMerger::default(), &runs, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_unsorted(path: &Path, records: &[(u64, String)]) {
        let mut file = File::create(path).unwrap();
        for (k, v) in records {
            write_record(&mut file, k, v).unwrap();
        }
        file.flush().unwrap();
    }

    fn drain(path: &Path) -> Vec<(u64, String)> {
        let mut reader = RecordReader::<u64, String>::open(path).unwrap();
        let mut out = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn sorts_in_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("in.kv");
        let output = dir.path().join("out.kv");
        write_unsorted(
            &input,
            &[(3, "c".into()), (1, "a".into()), (2, "b".into()), (1, "z".into())],
        );

        FileSorter::<u64, String>::sort(&ExternalFileSorter::default(), &input, &output).unwrap();

        assert_eq!(
            drain(&output),
            vec![
                (1, "a".to_string()),
                (1, "z".to_string()),
                (2, "b".to_string()),
                (3, "c".to_string()),
            ]
        );
        // The caller owns the input file's lifecycle.
        assert!(input.exists());
    }

    #[test]
    fn sorts_across_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("in.kv");
        let output = dir.path().join("out.kv");

        let mut records: Vec<(u64, String)> =
            (0..100).map(|i| ((i * 37) % 100, format!("v{i}"))).collect();
        write_unsorted(&input, &records);

        FileSorter::<u64, String>::sort(&ExternalFileSorter::new(8), &input, &output).unwrap();

        records.sort();
        assert_eq!(drain(&output), records);
        // Intermediate run files are consumed by the merge.
        let runs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map(|ext| ext.to_string_lossy().starts_with("run"))
                    .unwrap_or(false)
            })
            .collect();
        assert!(runs.is_empty());
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("in.kv");
        let output = dir.path().join("out.kv");
        File::create(&input).unwrap();

        FileSorter::<u64, String>::sort(&ExternalFileSorter::default(), &input, &output).unwrap();
        assert_eq!(drain(&output), vec![]);
    }
}
