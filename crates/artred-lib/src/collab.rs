//! Seams to the outside world: raw read sources, result reporting and
//! contaminant screening. The core only talks to these traits.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::warn;

use crate::error::{ArtredError, Result};
use crate::io::{FastxReader, FastxRecord};

/// Supplier of raw reads for one input file.
pub trait ReadSource {
    /// Next raw read, or `None` once exhausted.
    fn next_read(&mut self) -> Result<Option<FastxRecord>>;

    /// Bytes of (decompressed) input consumed so far.
    fn bytes_consumed(&self) -> u64;
}

/// Receiver of named results for external reporting.
pub trait ResultsSink: Send {
    fn add_count(&mut self, key: &str, value: u64);

    /// One bucket of a named distribution.
    fn add_bucket(&mut self, key: &str, bucket: u64, value: u64);
}

impl<S: ResultsSink> ResultsSink for Arc<Mutex<S>> {
    fn add_count(&mut self, key: &str, value: u64) {
        self.lock().add_count(key, value);
    }

    fn add_bucket(&mut self, key: &str, bucket: u64, value: u64) {
        self.lock().add_bucket(key, bucket, value);
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ResultsSink for NullSink {
    fn add_count(&mut self, _key: &str, _value: u64) {}
    fn add_bucket(&mut self, _key: &str, _bucket: u64, _value: u64) {}
}

/// Collects results in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub counts: BTreeMap<String, u64>,
    pub buckets: BTreeMap<String, Vec<(u64, u64)>>,
}

impl MemorySink {
    pub fn count(&self, key: &str) -> Option<u64> {
        self.counts.get(key).copied()
    }
}

impl ResultsSink for MemorySink {
    fn add_count(&mut self, key: &str, value: u64) {
        self.counts.insert(key.to_string(), value);
    }

    fn add_bucket(&mut self, key: &str, bucket: u64, value: u64) {
        self.buckets.entry(key.to_string()).or_default().push((bucket, value));
    }
}

/// Appends `key<TAB>value` lines to a file.
///
/// Write failures are logged once and the sink then goes quiet; [`TsvSink::finish`]
/// reports the first failure.
pub struct TsvSink {
    path: PathBuf,
    out: BufWriter<File>,
    failed: Option<std::io::Error>,
}

impl TsvSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ArtredError::io(&path, e))?;
        Ok(Self { path, out: BufWriter::new(file), failed: None })
    }

    fn write_line(&mut self, line: std::fmt::Arguments<'_>) {
        if self.failed.is_some() {
            return;
        }
        if let Err(e) = self.out.write_fmt(line).and_then(|_| self.out.write_all(b"\n")) {
            warn!("Results file {} not writable: {}", self.path.display(), e);
            self.failed = Some(e);
        }
    }

    pub fn finish(mut self) -> Result<()> {
        if let Some(e) = self.failed.take() {
            return Err(ArtredError::io(&self.path, e));
        }
        self.out.flush().map_err(|e| ArtredError::io(&self.path, e))
    }
}

impl ResultsSink for TsvSink {
    fn add_count(&mut self, key: &str, value: u64) {
        self.write_line(format_args!("{key}\t{value}"));
    }

    fn add_bucket(&mut self, key: &str, bucket: u64, value: u64) {
        self.write_line(format_args!("{key}\t{bucket}\t{value}"));
    }
}

/// Outcome of screening one read against the contaminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContaminantHit {
    /// The read lies wholly within a contaminant
    Contained,
    /// Longest contaminant overlaps at each end of the read (0 = none)
    Flanks { five: usize, three: usize },
}

pub trait ContaminantFilter: Send + Sync {
    /// Screen `read`, ignoring end overlaps shorter than `min_len`.
    fn screen(&self, read: &[u8], min_len: usize) -> ContaminantHit;
}

/// Exact end-overlap screening against a small set of contaminant sequences
/// (adapters, primers), both strands.
#[derive(Debug, Default)]
pub struct FlankContaminants {
    sequences: Vec<Vec<u8>>,
    /// Every proper suffix of every contaminant: matches a read's 5' end
    suffixes: FxHashSet<Vec<u8>>,
    /// Every proper prefix: matches a read's 3' end
    prefixes: FxHashSet<Vec<u8>>,
    longest: usize,
}

impl FlankContaminants {
    pub fn from_sequences<I, S>(seqs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut this = Self::default();
        for s in seqs {
            let fwd: Vec<u8> = s.as_ref().iter().map(u8::to_ascii_uppercase).collect();
            if fwd.is_empty() {
                continue;
            }
            let rev = reverse_complement(&fwd);
            for c in [fwd, rev] {
                this.longest = this.longest.max(c.len());
                for k in 1..=c.len() {
                    this.suffixes.insert(c[c.len() - k..].to_vec());
                    this.prefixes.insert(c[..k].to_vec());
                }
                this.sequences.push(c);
            }
        }
        this
    }

    /// Load contaminants from a FASTA file.
    pub fn from_fasta(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = FastxReader::from_path(path.as_ref())?;
        let mut seqs = Vec::new();
        while let Some(rec) = reader.next()? {
            seqs.push(rec.sequence);
        }
        Ok(Self::from_sequences(seqs))
    }

    pub fn len(&self) -> usize {
        self.sequences.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

impl ContaminantFilter for FlankContaminants {
    fn screen(&self, read: &[u8], min_len: usize) -> ContaminantHit {
        if self.sequences.is_empty() || read.is_empty() {
            return ContaminantHit::Flanks { five: 0, three: 0 };
        }
        let read: Vec<u8> = read.iter().map(u8::to_ascii_uppercase).collect();
        if read.len() <= self.longest
            && self
                .sequences
                .iter()
                .any(|c| c.windows(read.len()).any(|w| w == read.as_slice()))
        {
            return ContaminantHit::Contained;
        }
        let min_len = min_len.max(1);
        let max_len = self.longest.min(read.len());
        let five = (min_len..=max_len)
            .rev()
            .find(|&k| self.suffixes.contains(&read[..k]))
            .unwrap_or(0);
        let three = (min_len..=max_len)
            .rev()
            .find(|&k| self.prefixes.contains(&read[read.len() - k..]))
            .unwrap_or(0);
        ContaminantHit::Flanks { five, three }
    }
}

fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            other => other,
        })
        .collect()
}
