//! Result sink that writes reduced records to a per-partition text file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::codec::Datum;
use crate::{RecordSink, Result};

/// Writes one `key TAB value CR` line per record into a file named
/// `<filespec><partition+1>_of_<num_partitions>`.
pub struct ReduceFileOutput {
    filename: PathBuf,
    out: BufWriter<File>,
}

impl ReduceFileOutput {
    pub fn new(
        filespec: impl AsRef<Path>,
        partition: usize,
        num_partitions: usize,
    ) -> Result<Self> {
        let filename = PathBuf::from(format!(
            "{}{}_of_{}",
            filespec.as_ref().display(),
            partition + 1,
            num_partitions
        ));
        let out = BufWriter::new(File::create(&filename)?);
        Ok(Self { filename, out })
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

impl<K: Datum, V: Datum> RecordSink<K, V> for ReduceFileOutput {
    fn accept(&mut self, key: &K, value: &V) -> Result<()> {
        let mut line = Vec::new();
        key.encode(&mut line);
        line.push(b'\t');
        value.encode(&mut line);
        line.push(b'\r');
        self.out.write_all(&line)?;
        Ok(())
    }
}
