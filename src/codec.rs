//! Framed on-disk encoding of key/value records.
//!
//! Each record is written as
//!
//! ```text
//! <key-length> TAB <key-bytes> TAB <value-length> TAB <value-bytes> CR
//! ```
//!
//! with both lengths in ASCII decimal. Length-prefixing the payloads means
//! keys and values may contain any byte, including the separators. A
//! zero-length key prefix doubles as the end-of-stream marker, so readers
//! stop cleanly on truncated or empty files.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log::warn;

use crate::{Error, Result};

const SEP: u8 = b'\t';
const TERM: u8 = b'\r';

/// A value that can live on either side of a framed record: totally ordered,
/// cloneable, and convertible to and from raw bytes.
pub trait Datum: Clone + Ord {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl Datum for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl Datum for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Corrupt(format!("utf8 key: {e}")))
    }
}

macro_rules! decimal_datum {
    ($($t:ty),*) => {
        $(
            impl Datum for $t {
                fn encode(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(self.to_string().as_bytes());
                }

                fn decode(bytes: &[u8]) -> Result<Self> {
                    std::str::from_utf8(bytes)
                        .map_err(|e| Error::Corrupt(format!("non-utf8 number: {e}")))?
                        .parse()
                        .map_err(|e| Error::Corrupt(format!("bad number: {e}")))
                }
            }
        )*
    };
}

decimal_datum!(u32, u64, i64);

/// Write one framed record. Fails only if the underlying stream does.
pub fn write_record<W: Write, K: Datum, V: Datum>(out: &mut W, key: &K, value: &V) -> Result<()> {
    let mut kbuf = Vec::new();
    key.encode(&mut kbuf);
    let mut vbuf = Vec::new();
    value.encode(&mut vbuf);

    write!(out, "{}", kbuf.len())?;
    out.write_all(&[SEP])?;
    out.write_all(&kbuf)?;
    out.write_all(&[SEP])?;
    write!(out, "{}", vbuf.len())?;
    out.write_all(&[SEP])?;
    out.write_all(&vbuf)?;
    out.write_all(&[TERM])?;
    Ok(())
}

/// Streaming reader over a framed spill file.
///
/// Malformed framing is reported once at `warn` and then treated as end of
/// stream, so a truncated spill yields its intact prefix instead of an error.
pub struct RecordReader<K, V> {
    inner: BufReader<File>,
    path: PathBuf,
    _record: PhantomData<(K, V)>,
}

impl<K: Datum, V: Datum> RecordReader<K, V> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            inner: BufReader::new(file),
            path: path.as_ref().to_path_buf(),
            _record: PhantomData,
        })
    }

    /// Read the next record. `Ok(None)` at clean end of stream, at a
    /// zero-length key prefix, or after malformed framing.
    pub fn next_record(&mut self) -> Result<Option<(K, V)>> {
        let key_len = match self.read_len(true)? {
            Some(0) | None => return Ok(None),
            Some(n) => n,
        };

        let Some(key_bytes) = self.read_payload(key_len, SEP)? else {
            return Ok(None);
        };
        let value_len = match self.read_len(false)? {
            Some(n) => n,
            None => return Ok(None),
        };
        let Some(value_bytes) = self.read_payload(value_len, TERM)? else {
            return Ok(None);
        };

        let key = match K::decode(&key_bytes) {
            Ok(key) => key,
            Err(e) => {
                warn!("{}: {e}; treating as end of stream", self.path.display());
                return Ok(None);
            }
        };
        let value = match V::decode(&value_bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}: {e}; treating as end of stream", self.path.display());
                return Ok(None);
            }
        };
        Ok(Some((key, value)))
    }

    /// Parse an ASCII-decimal length up to the next separator. At the key
    /// position a clean EOF is a normal end of stream; anywhere else a
    /// missing or malformed prefix means truncation.
    fn read_len(&mut self, at_record_start: bool) -> Result<Option<usize>> {
        let mut buf = Vec::new();
        self.inner.read_until(SEP, &mut buf)?;

        if buf.is_empty() {
            if !at_record_start {
                warn!("{}: truncated record", self.path.display());
            }
            return Ok(None);
        }
        if buf.last() != Some(&SEP) {
            warn!("{}: truncated length prefix", self.path.display());
            return Ok(None);
        }
        buf.pop();
        if buf.is_empty() {
            warn!("{}: empty length prefix", self.path.display());
            return Ok(None);
        }

        let mut len: usize = 0;
        for &b in &buf {
            if !b.is_ascii_digit() {
                warn!("{}: malformed length prefix", self.path.display());
                return Ok(None);
            }
            len = len * 10 + (b - b'0') as usize;
        }
        Ok(Some(len))
    }

    /// Read `len` payload bytes plus the trailing separator byte.
    fn read_payload(&mut self, len: usize, terminator: u8) -> Result<Option<Vec<u8>>> {
        let mut payload = vec![0u8; len + 1];
        match self.inner.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!("{}: truncated record", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        if payload.pop() != Some(terminator) {
            warn!("{}: missing record separator", self.path.display());
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn roundtrip<K: Datum + std::fmt::Debug, V: Datum + std::fmt::Debug>(
        records: &[(K, V)],
    ) -> Vec<(K, V)> {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.kv");

        let mut file = std::fs::File::create(&path).unwrap();
        for (k, v) in records {
            write_record(&mut file, k, v).unwrap();
        }
        file.flush().unwrap();

        let mut reader = RecordReader::<K, V>::open(&path).unwrap();
        let mut out = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn roundtrip_strings() {
        let records = vec![
            ("apple".to_string(), "1".to_string()),
            ("banana".to_string(), "two".to_string()),
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn roundtrip_numbers() {
        let records: Vec<(String, u64)> = vec![("a".into(), 0), ("b".into(), u64::MAX)];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn keys_may_contain_separators() {
        let records: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b"a\tb".to_vec(), b"v1".to_vec()),
            (b"c\rd".to_vec(), b"line\rbreak".to_vec()),
            (b"\t\t\r".to_vec(), vec![]),
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn empty_value_roundtrips() {
        let records: Vec<(String, String)> = vec![("k".into(), "".into())];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn zero_length_key_prefix_ends_stream() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.kv");
        let mut file = std::fs::File::create(&path).unwrap();
        write_record(&mut file, &"a".to_string(), &"1".to_string()).unwrap();
        // A record with an empty key reads back as end of stream.
        file.write_all(b"0\t\t1\tx\r").unwrap();
        write_record(&mut file, &"b".to_string(), &"2".to_string()).unwrap();

        let mut reader = RecordReader::<String, String>::open(&path).unwrap();
        assert_eq!(
            reader.next_record().unwrap(),
            Some(("a".to_string(), "1".to_string()))
        );
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.kv");
        let mut file = std::fs::File::create(&path).unwrap();
        write_record(&mut file, &"a".to_string(), &"1".to_string()).unwrap();
        file.write_all(b"5\tab").unwrap(); // cut off mid-key

        let mut reader = RecordReader::<String, String>::open(&path).unwrap();
        assert_eq!(
            reader.next_record().unwrap(),
            Some(("a".to_string(), "1".to_string()))
        );
        assert_eq!(reader.next_record().unwrap(), None);
        assert_eq!(reader.next_record().unwrap(), None);
    }
}
