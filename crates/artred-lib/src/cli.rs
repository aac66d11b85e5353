use std::path::PathBuf;

use crate::concurrency::MAX_WORKER_THREADS;
use crate::error::{ArtredError, Result};
use crate::lifecycle::MAX_OVERLAP_PASSES;

/// Most path specs accepted for either mate
pub const MAX_INPUT_SPECS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Reduce, then write FASTA
    Fasta,
    /// Reduce, then write the packed checkpoint format
    Packed,
    /// Convert a previously written packed file to FASTA, no reduction
    PackedToFasta,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QualitySchema {
    Unknown,
    Illumina,
    Solexa,
    Sanger,
    /// Qualities are never inspected
    Ignore,
}

impl QualitySchema {
    /// ASCII offset of Phred 0, `None` when qualities are ignored.
    pub fn phred_offset(self) -> Option<u8> {
        match self {
            QualitySchema::Sanger => Some(b'!'),
            QualitySchema::Unknown | QualitySchema::Illumina | QualitySchema::Solexa => Some(b'@'),
            QualitySchema::Ignore => None,
        }
    }
}

/// Per-read filtering applied before a read enters the store.
#[derive(Clone, Debug)]
pub struct ReadFilterConfig {
    /// Quality score encoding of FASTQ input
    pub quality: QualitySchema,
    /// Minimum mean Phred score (0 = no quality filtering)
    pub min_phred: u32,
    /// Bases trimmed from the 5' end
    pub trim5: u32,
    /// Bases trimmed from the 3' end
    pub trim3: u32,
    /// Most indeterminate bases tolerated per 100 bases
    pub max_ns: u32,
    /// Reads shorter than this after trimming are dropped
    pub min_seq_len: u32,
    /// Truncate accepted reads to this length (0 = no truncation)
    pub trim_seq_len: u32,
    /// Only every Nth parsed read is considered
    pub sample_nth: u32,
    /// Cap on accepted reads per file (0 = no cap)
    pub zreads: u32,
}

impl Default for ReadFilterConfig {
    fn default() -> Self {
        Self {
            quality: QualitySchema::Sanger,
            min_phred: 0,
            trim5: 0,
            trim3: 0,
            max_ns: 1,
            min_seq_len: 50,
            trim_seq_len: 0,
            sample_nth: 1,
            zreads: 0,
        }
    }
}

impl ReadFilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_phred != 0 && !(15..=40).contains(&self.min_phred) {
            return Err(ArtredError::invalid("min_phred", format!("{} not 0 or 15..=40", self.min_phred)));
        }
        for (name, v) in [("trim5", self.trim5), ("trim3", self.trim3)] {
            if v > 20 {
                return Err(ArtredError::invalid(name, format!("{v} exceeds 20")));
            }
        }
        if self.max_ns > 5 {
            return Err(ArtredError::invalid("max_ns", format!("{} exceeds 5", self.max_ns)));
        }
        if !(20..=10_000).contains(&self.min_seq_len) {
            return Err(ArtredError::invalid("min_seq_len", format!("{} not in 20..=10000", self.min_seq_len)));
        }
        if self.trim_seq_len != 0 && !(self.min_seq_len..=1000).contains(&self.trim_seq_len) {
            return Err(ArtredError::invalid(
                "trim_seq_len",
                format!("{} not 0 or {}..=1000", self.trim_seq_len, self.min_seq_len),
            ));
        }
        if self.sample_nth == 0 {
            return Err(ArtredError::invalid("sample_nth", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ReduceConfig {
    /// Processing mode
    pub mode: OutputMode,
    /// Single-end or mate-1 input path specs, each may contain `*` or `?`
    pub inputs: Vec<PathBuf>,
    /// Mate-2 input path specs; non-empty means paired-end
    pub pe2_inputs: Vec<PathBuf>,
    /// Packed checkpoint loaded if present and valid, otherwise written after loading
    pub checkpoint: Option<PathBuf>,
    /// Output path prefix
    pub output: PathBuf,
    /// Duplicate distribution CSV prefix
    pub dedup_dist: Option<PathBuf>,
    /// Skip duplicate removal
    pub no_dedupe: bool,
    /// Only the sense strand is considered when deduplicating
    pub strand_specific: bool,
    /// Treat paired-end mates as independent reads
    pub independent_pairs: bool,
    /// Minimum overlap (0 = auto, -1 = no overlap removal)
    pub min_overlap: i32,
    /// Minimum non-overlapping flank
    pub min_flank: u32,
    /// Overlap removal passes
    pub iterative_passes: u32,
    /// Number of threads (0 = auto-detect)
    pub threads: usize,
    /// Read filtering
    pub filter: ReadFilterConfig,
    /// FASTA of contaminant sequences
    pub contaminants: Option<PathBuf>,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::Fasta,
            inputs: Vec::new(),
            pe2_inputs: Vec::new(),
            checkpoint: None,
            output: PathBuf::new(),
            dedup_dist: None,
            no_dedupe: false,
            strand_specific: false,
            independent_pairs: false,
            min_overlap: 0,
            min_flank: 1,
            iterative_passes: 1,
            threads: 0,
            filter: ReadFilterConfig::default(),
            contaminants: None,
        }
    }
}

impl ReduceConfig {
    pub fn is_paired(&self) -> bool {
        !self.pe2_inputs.is_empty()
    }

    /// Worker thread count with auto-detection and the hard cap applied.
    pub fn resolved_threads(&self) -> usize {
        let n = if self.threads == 0 { num_cpus() } else { self.threads };
        n.clamp(1, MAX_WORKER_THREADS)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == OutputMode::PackedToFasta {
            if self.inputs.len() != 1 {
                return Err(ArtredError::invalid("inputs", "packed to FASTA takes exactly one packed file"));
            }
        } else if self.inputs.is_empty() && self.checkpoint.is_none() {
            return Err(ArtredError::invalid("inputs", "no input files or checkpoint"));
        }
        if self.output.as_os_str().is_empty() {
            return Err(ArtredError::invalid("output", "no output path"));
        }
        if self.inputs.len() > MAX_INPUT_SPECS || self.pe2_inputs.len() > MAX_INPUT_SPECS {
            return Err(ArtredError::invalid("inputs", format!("more than {MAX_INPUT_SPECS} path specs")));
        }
        if self.is_paired() && self.pe2_inputs.len() != self.inputs.len() {
            return Err(ArtredError::invalid(
                "pe2_inputs",
                format!("{} mate-2 specs for {} mate-1 specs", self.pe2_inputs.len(), self.inputs.len()),
            ));
        }
        if !(self.min_overlap == -1 || self.min_overlap == 0 || (25..=150).contains(&self.min_overlap)) {
            return Err(ArtredError::invalid(
                "min_overlap",
                format!("{} not -1, 0 or 25..=150", self.min_overlap),
            ));
        }
        if !(1..=25).contains(&self.min_flank) {
            return Err(ArtredError::invalid("min_flank", format!("{} not in 1..=25", self.min_flank)));
        }
        if !(1..=MAX_OVERLAP_PASSES).contains(&self.iterative_passes) {
            return Err(ArtredError::invalid(
                "iterative_passes",
                format!("{} not in 1..={MAX_OVERLAP_PASSES}", self.iterative_passes),
            ));
        }
        self.filter.validate()
    }
}

pub fn num_cpus() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ReduceConfig {
        ReduceConfig {
            inputs: vec![PathBuf::from("reads.fq")],
            output: PathBuf::from("out"),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_min_overlap_range() {
        for ok in [-1, 0, 25, 150] {
            let cfg = ReduceConfig { min_overlap: ok, ..base() };
            assert!(cfg.validate().is_ok(), "{ok}");
        }
        for bad in [-2, 24, 151] {
            let cfg = ReduceConfig { min_overlap: bad, ..base() };
            assert!(matches!(cfg.validate(), Err(ArtredError::InvalidParams { .. })), "{bad}");
        }
    }

    #[test]
    fn test_iterative_passes_range() {
        let cfg = ReduceConfig { iterative_passes: MAX_OVERLAP_PASSES, ..base() };
        assert!(cfg.validate().is_ok());
        for bad in [0, MAX_OVERLAP_PASSES + 1] {
            let cfg = ReduceConfig { iterative_passes: bad, ..base() };
            assert!(matches!(cfg.validate(), Err(ArtredError::InvalidParams { .. })), "{bad}");
        }
    }

    #[test]
    fn test_paired_spec_counts_must_match() {
        let cfg = ReduceConfig {
            pe2_inputs: vec![PathBuf::from("a_2.fq"), PathBuf::from("b_2.fq")],
            ..base()
        };
        assert!(cfg.is_paired());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_filter_ranges() {
        let filter = ReadFilterConfig { trim_seq_len: 40, ..Default::default() };
        assert!(filter.validate().is_err());
        let filter = ReadFilterConfig { trim_seq_len: 80, min_phred: 20, ..Default::default() };
        assert!(filter.validate().is_ok());
        let filter = ReadFilterConfig { min_phred: 10, ..Default::default() };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_packed_to_fasta_needs_one_input() {
        let cfg = ReduceConfig { mode: OutputMode::PackedToFasta, inputs: vec![], ..base() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_thread_cap() {
        let cfg = ReduceConfig { threads: 1000, ..base() };
        assert_eq!(cfg.resolved_threads(), MAX_WORKER_THREADS);
        assert_eq!(base().resolved_threads(), num_cpus().min(MAX_WORKER_THREADS));
    }
}
