use std::fs;
use std::path::PathBuf;

use clap::Parser;

use kvshuffle::{Combiner, PartitionStore, RecordSink, ReduceFileOutput, Result};

#[derive(Parser, Debug)]
#[command(name = "wordcount", version, about = "Word count over text files")]
struct Args {
    /// Input text files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Prefix for result files; the partition suffix is appended
    #[arg(long, default_value = "wordcount_")]
    out: String,

    #[arg(long, default_value_t = 4)]
    partitions: usize,

    /// Run the summing combiner before the reduce phase
    #[arg(long)]
    combine: bool,
}

/// Sums the counts of one word and feeds the total back into the store.
struct SumCombiner {
    total: u64,
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

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut store = PartitionStore::<String, u64>::new(args.partitions)?;

    let mut words = 0u64;
    for input in &args.inputs {
        let text = fs::read_to_string(input)?;
        for token in text.split_whitespace() {
            let word = token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            words += 1;
            store.insert(word, 1)?;
        }
    }
    eprintln!("mapped {words} words into {} partitions", args.partitions);

    if args.combine {
        store.combine(&mut SumCombiner { total: 0 })?;
    }

    let num_partitions = store.num_partitions();
    for partition in store.partitions().collect::<Vec<_>>() {
        store.shuffle(partition)?;
        let mut sink = ReduceFileOutput::new(&args.out, partition, num_partitions)?;
        store.reduce(partition, |key, values| {
            let total: u64 = values.iter().sum();
            if let Err(e) = sink.accept(key, &total) {
                log::warn!("failed to write result for {key}: {e}");
            }
        })?;
        sink.flush()?;
        eprintln!("wrote {}", sink.filename().display());
    }

    Ok(())
}
