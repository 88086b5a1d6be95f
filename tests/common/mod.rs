#![allow(dead_code)]

use kvshuffle::{Combiner, RecordSink, Result};

pub fn scratch() -> tempfile::TempDir {
    tempfile::TempDir::new().expect("failed to create scratch dir")
}

/// Sums `u64` counts per key and feeds the total back through the sink.
pub struct SumCombiner {
    total: u64,
}

impl SumCombiner {
    pub fn new() -> Self {
        Self { total: 0 }
    }
}

impl Combiner<String, u64> for SumCombiner {
    fn start(&mut self, _key: &String) {
        self.total = 0;
    }

    fn add(&mut self, value: u64) {
        self.total += value;
    }

    fn finish(&mut self, key: &String, sink: &mut dyn RecordSink<String, u64>) -> Result<()> {
        sink.accept(key, &self.total)
    }
}
