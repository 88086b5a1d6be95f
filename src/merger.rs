//! Bounded-fan-in k-way merge of sorted fragment files.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::codec::{write_record, Datum, RecordReader};
use crate::{FileMerger, Result};

/// Merges sorted framed files with a fixed cap on simultaneously open
/// inputs. When more fragments are pending than the cap allows, the merged
/// output so far is renamed to a pass file and re-enters the queue as an
/// input; each pass strictly shrinks the queue, so the loop terminates.
/// Every consumed input, pass files included, is deleted at the end.
pub struct FragmentMerger {
    max_open: usize,
}

impl FragmentMerger {
    pub fn new(max_open: usize) -> Self {
        assert!(max_open >= 2, "merge fan-in must be at least 2");
        Self { max_open }
    }
}

impl Default for FragmentMerger {
    fn default() -> Self {
        Self::new(64)
    }
}

impl<K: Datum, V: Datum> FileMerger<K, V> for FragmentMerger {
    fn merge(&self, inputs: &[PathBuf], dest: &Path) -> Result<()> {
        let mut pending: VecDeque<PathBuf> = inputs.iter().cloned().collect();
        let mut consumed: Vec<PathBuf> = inputs.to_vec();
        let mut pass = 0usize;

        if pending.is_empty() {
            File::create(dest)?;
            return Ok(());
        }

        while !pending.is_empty() {
            let mut frontier: Vec<(RecordReader<K, V>, (K, V))> = Vec::new();
            while frontier.len() < self.max_open {
                let Some(path) = pending.pop_front() else {
                    break;
                };
                let mut reader = RecordReader::open(&path)?;
                if let Some(first) = reader.next_record()? {
                    frontier.push((reader, first));
                }
            }
            debug!(
                "merge pass {pass}: {} streams, {} pending",
                frontier.len(),
                pending.len()
            );

            let mut out = BufWriter::new(File::create(dest)?);
            while !frontier.is_empty() {
                let min = frontier
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.1.cmp(&b.1))
                    .map(|(idx, _)| idx)
                    .unwrap();
                let record = frontier[min].1.clone();

                // Emit every stream's copy of the minimum record and advance
                // those streams; equal records therefore land consecutively.
                let mut idx = 0;
                while idx < frontier.len() {
                    if frontier[idx].1 == record {
                        write_record(&mut out, &record.0, &record.1)?;
                        match frontier[idx].0.next_record()? {
                            Some(next) => {
                                frontier[idx].1 = next;
                                idx += 1;
                            }
                            None => {
                                frontier.remove(idx);
                            }
                        }
                    } else {
                        idx += 1;
                    }
                }
            }
            out.flush()?;
            drop(out);

            if !pending.is_empty() {
                // More inputs remain than could be opened at once: demote the
                // output to a pending input and go around again.
                let pass_file = dest.with_extension(format!("pass{pass}"));
                pass += 1;
                std::fs::rename(dest, &pass_file)?;
                pending.push_back(pass_file.clone());
                consumed.push(pass_file);
            }
        }

        for path in consumed {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("failed to delete fragment {}: {e}", path.display());
                }
            }
        }
        Ok(())
    }
}
