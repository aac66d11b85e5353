//! Raw read intake: input expansion, memory estimation, per-read filtering
//! and loading into the packed store.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::cli::{ReadFilterConfig, ReduceConfig};
use crate::collab::{ContaminantFilter, ContaminantHit, ReadSource};
use crate::error::{ArtredError, Result};
use crate::io::FastxReader;
use crate::packed::{PackedStore, SeqFlags};

/// Source file slots, slot 0 reserved
pub const MAX_SOURCE_FILES: usize = 201;
/// Longest path recorded for a source file
pub const MAX_PATH_BYTES: usize = 260;
/// Reads sampled per file when estimating memory
pub const EST_SAMPLE_READS: usize = 10_000;
/// Assumed gzip compression ratio of raw reads
pub const GZIP_RATIO: u64 = 4;
/// Fewest sequences the reduction stages accept
pub const MIN_WORKING_SET: u64 = 100;
/// Lowest Phred score any single base may have
const MIN_BASE_PHRED: u32 = 10;
/// Window over which indeterminate bases are counted
const NS_WINDOW: usize = 100;

/// One loaded input file and its filtering statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceFile {
    pub file_id: u8,
    /// Id of the other mate's file, 0 for single-end
    pub pe_file_id: u8,
    pub parsed: u32,
    pub underlength: u32,
    pub excess_ns: u32,
    pub accepted: u32,
    pub path: String,
}

/// Table of every raw input file, ids assigned from 1 in registration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceFiles {
    files: Vec<SourceFile>,
}

impl SourceFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records.
    pub fn from_records(files: Vec<SourceFile>) -> Self {
        Self { files }
    }

    pub fn register(&mut self, path: &Path, pe_file_id: u8) -> Result<u8> {
        if self.files.len() + 1 >= MAX_SOURCE_FILES {
            return Err(ArtredError::invalid(
                "inputs",
                format!("more than {} input files", MAX_SOURCE_FILES - 1),
            ));
        }
        let file_id = (self.files.len() + 1) as u8;
        let mut path = path.display().to_string();
        if path.len() >= MAX_PATH_BYTES {
            let mut cut = MAX_PATH_BYTES - 1;
            while !path.is_char_boundary(cut) {
                cut -= 1;
            }
            path.truncate(cut);
        }
        self.files.push(SourceFile { file_id, pe_file_id, path, ..Default::default() });
        Ok(file_id)
    }

    pub fn get(&self, file_id: u8) -> Option<&SourceFile> {
        (file_id as usize).checked_sub(1).and_then(|i| self.files.get(i))
    }

    fn get_mut(&mut self, file_id: u8) -> Option<&mut SourceFile> {
        (file_id as usize).checked_sub(1).and_then(|i| self.files.get_mut(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn record(&mut self, file_id: u8, counts: &FileCounts) {
        if let Some(f) = self.get_mut(file_id) {
            f.parsed += counts.parsed;
            f.underlength += counts.underlength;
            f.excess_ns += counts.excess_ns;
            f.accepted += counts.accepted;
        }
    }
}

/// Outcome of filtering a single read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the bases in this range of the raw read
    Accept(Range<usize>),
    Contaminant,
    Underlength,
    LowQuality,
    ExcessNs,
}

/// Per-read filters in their fixed order: contaminant flanks, length,
/// quality, trimming, then indeterminate bases.
pub struct ReadFilter<'a> {
    cfg: &'a ReadFilterConfig,
    contaminants: Option<&'a dyn ContaminantFilter>,
}

impl<'a> ReadFilter<'a> {
    pub fn new(cfg: &'a ReadFilterConfig, contaminants: Option<&'a dyn ContaminantFilter>) -> Self {
        Self { cfg, contaminants }
    }

    pub fn apply(&self, seq: &[u8], quality: Option<&[u8]>) -> Verdict {
        let len = seq.len();
        let mut trim5 = self.cfg.trim5 as usize;
        let mut trim3 = self.cfg.trim3 as usize;

        if let Some(filter) = self.contaminants {
            match filter.screen(seq, trim5.min(trim3) + 1) {
                ContaminantHit::Contained => return Verdict::Contaminant,
                ContaminantHit::Flanks { five, three } => {
                    trim5 = trim5.max(five);
                    trim3 = trim3.max(three);
                }
            }
        }

        if trim5 + trim3 + self.cfg.min_seq_len as usize > len {
            return Verdict::Underlength;
        }

        if self.cfg.min_phred > 0 {
            if let (Some(qual), Some(offset)) = (quality, self.cfg.quality.phred_offset()) {
                let end = qual.len().saturating_sub(trim3);
                if !meets_min_phred(qual.get(trim5..end).unwrap_or_default(), offset, self.cfg.min_phred) {
                    return Verdict::LowQuality;
                }
            }
        }

        let mut end = len - trim3;
        if self.cfg.trim_seq_len > 0 {
            end = end.min(trim5 + self.cfg.trim_seq_len as usize);
        }
        if excess_ns(&seq[trim5..end], self.cfg.max_ns as usize) {
            return Verdict::ExcessNs;
        }
        Verdict::Accept(trim5..end)
    }
}

/// Any base under Phred 10 fails, as does a mean (with +1 rounding) under `min_phred`.
fn meets_min_phred(qual: &[u8], offset: u8, min_phred: u32) -> bool {
    if qual.is_empty() {
        return true;
    }
    let mut sum = 1u32;
    for &q in qual {
        let score = q.saturating_sub(offset) as u32;
        if score < MIN_BASE_PHRED {
            return false;
        }
        sum += score;
    }
    sum / qual.len() as u32 >= min_phred
}

fn excess_ns(seq: &[u8], max_ns: usize) -> bool {
    let is_n = |b: u8| !matches!(b, b'A' | b'C' | b'G' | b'T' | b'a' | b'c' | b'g' | b't');
    let mut ns = 0usize;
    for i in 0..seq.len() {
        if i >= NS_WINDOW && is_n(seq[i - NS_WINDOW]) {
            ns -= 1;
        }
        if is_n(seq[i]) {
            ns += 1;
        }
        if ns > max_ns {
            return true;
        }
    }
    seq.len() <= NS_WINDOW && ns > max_ns * seq.len() / NS_WINDOW
}

/// Filtering tallies for one file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileCounts {
    pub parsed: u32,
    pub underlength: u32,
    pub excess_ns: u32,
    pub low_quality: u32,
    pub contaminant: u32,
    pub accepted: u32,
}

impl FileCounts {
    fn tally(&mut self, verdict: &Verdict) {
        match verdict {
            Verdict::Accept(_) => {}
            Verdict::Contaminant => self.contaminant += 1,
            Verdict::Underlength => self.underlength += 1,
            Verdict::LowQuality => self.low_quality += 1,
            Verdict::ExcessNs => self.excess_ns += 1,
        }
    }
}

/// Streams reads from sources through a [`ReadFilter`] into a store.
pub struct ReadLoader<'a> {
    filter: ReadFilter<'a>,
    sample_nth: u32,
    zreads: u32,
}

impl<'a> ReadLoader<'a> {
    pub fn new(cfg: &'a ReadFilterConfig, contaminants: Option<&'a dyn ContaminantFilter>) -> Self {
        Self { filter: ReadFilter::new(cfg, contaminants), sample_nth: cfg.sample_nth.max(1), zreads: cfg.zreads }
    }

    fn sampled_out(&self, parsed: u32) -> bool {
        self.sample_nth > 1 && parsed % self.sample_nth != 0
    }

    fn capped(&self, accepted: u32) -> bool {
        self.zreads > 0 && accepted >= self.zreads
    }

    /// Load single-end reads from `source`, tagging them with `file_id`.
    pub fn load_single(
        &self,
        store: &mut PackedStore,
        file_id: u8,
        source: &mut dyn ReadSource,
    ) -> Result<FileCounts> {
        let mut counts = FileCounts::default();
        while let Some(rec) = source.next_read()? {
            counts.parsed += 1;
            let verdict = self.filter.apply(&rec.sequence, rec.quality.as_deref());
            counts.tally(&verdict);
            let Verdict::Accept(range) = verdict else {
                continue;
            };
            if self.sampled_out(counts.parsed) {
                continue;
            }
            store.append(file_id, SeqFlags::NONE, &rec.sequence[range])?;
            counts.accepted += 1;
            if self.capped(counts.accepted) {
                break;
            }
        }
        Ok(counts)
    }

    /// Load mate pairs, mate 2 stored reverse complemented so both mates read
    /// in the same orientation. A pair is accepted only if both mates pass.
    pub fn load_paired(
        &self,
        store: &mut PackedStore,
        file_ids: (u8, u8),
        pe1: &mut dyn ReadSource,
        pe2: &mut dyn ReadSource,
        pe2_path: &Path,
    ) -> Result<(FileCounts, FileCounts)> {
        let mut c1 = FileCounts::default();
        let mut c2 = FileCounts::default();
        loop {
            let (r1, r2) = match (pe1.next_read()?, pe2.next_read()?) {
                (None, None) => break,
                (Some(r1), Some(r2)) => (r1, r2),
                _ => {
                    return Err(ArtredError::malformed(
                        pe2_path,
                        format!("mate files hold different read counts after {} pairs", c1.parsed),
                    ))
                }
            };
            c1.parsed += 1;
            c2.parsed += 1;
            let v1 = self.filter.apply(&r1.sequence, r1.quality.as_deref());
            c1.tally(&v1);
            let Verdict::Accept(range1) = v1 else {
                continue;
            };
            let v2 = self.filter.apply(&r2.sequence, r2.quality.as_deref());
            c2.tally(&v2);
            let Verdict::Accept(range2) = v2 else {
                continue;
            };
            if self.sampled_out(c1.parsed) {
                continue;
            }
            store.append(file_ids.0, SeqFlags::PE, &r1.sequence[range1])?;
            let id2 = store.append(file_ids.1, SeqFlags::PE | SeqFlags::PE2, &r2.sequence[range2])?;
            store.reverse_complement(id2)?;
            c1.accepted += 1;
            c2.accepted += 1;
            if self.capped(c1.accepted) {
                break;
            }
        }
        Ok((c1, c2))
    }
}

/// Expand `*` and `?` in the file name part of `spec`; plain paths pass through.
pub fn expand_input_spec(spec: &Path) -> Result<Vec<PathBuf>> {
    let Some(name) = spec.file_name().and_then(|n| n.to_str()) else {
        return Ok(vec![spec.to_path_buf()]);
    };
    if !name.contains(['*', '?']) {
        return Ok(vec![spec.to_path_buf()]);
    }
    let dir = match spec.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let entries = std::fs::read_dir(&dir).map_err(|e| ArtredError::io(&dir, e))?;
    let mut matched = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ArtredError::io(&dir, e))?;
        let file_name = entry.file_name();
        if let Some(candidate) = file_name.to_str() {
            if wildcard_match(name.as_bytes(), candidate.as_bytes()) && entry.path().is_file() {
                matched.push(entry.path());
            }
        }
    }
    if matched.is_empty() {
        return Err(ArtredError::invalid("inputs", format!("no files match '{}'", spec.display())));
    }
    matched.sort();
    Ok(matched)
}

fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((sp, sn)) = star {
            p = sp + 1;
            n = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Sampled size of one input file.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FileEstimate {
    pub reads: u64,
    /// Mean read length after trimming
    pub mean_len: u32,
    /// Arena bytes per read
    pub bytes_per_read: u64,
}

/// Estimate the read count and packed footprint of `path` from its first reads.
pub fn estimate_file(path: &Path, cfg: &ReadFilterConfig) -> Result<FileEstimate> {
    let file_size = std::fs::metadata(path).map_err(|e| ArtredError::io(path, e))?.len();
    let mut reader = FastxReader::from_path(path)?;
    let ratio = if reader.is_compressed() { GZIP_RATIO } else { 1 };
    estimate_source(&mut reader, file_size * ratio, cfg)
}

/// Estimate from the first reads of `source`, scaling by the bytes they
/// consumed against `input_bytes` of uncompressed input.
pub fn estimate_source(source: &mut dyn ReadSource, input_bytes: u64, cfg: &ReadFilterConfig) -> Result<FileEstimate> {
    let mut sampled = 0u64;
    let mut total_len = 0u64;
    while sampled < EST_SAMPLE_READS as u64 {
        let Some(rec) = source.next_read()? else {
            break;
        };
        sampled += 1;
        total_len += rec.sequence.len() as u64;
    }
    let consumed = source.bytes_consumed();
    if sampled == 0 || consumed == 0 {
        return Ok(FileEstimate::default());
    }

    let mean = (total_len / sampled) as u32;
    let trims = cfg.trim5 + cfg.trim3;
    if mean < trims + 10 {
        return Err(ArtredError::InsufficientData {
            stage: "mean read length after trimming",
            found: mean as u64,
            required: (trims + 10) as u64,
        });
    }
    let mut mean_len = mean - trims;
    if cfg.trim_seq_len > 0 {
        mean_len = mean_len.min(cfg.trim_seq_len);
    }

    let reads = (input_bytes * sampled / consumed).max(sampled);
    let raw = 4 * (mean_len as u64).div_ceil(15) + 12;
    let bytes_per_read = (raw * 105 / 100).div_ceil(4) * 4;
    Ok(FileEstimate { reads, mean_len, bytes_per_read })
}

/// Combined estimate over every input file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryEstimate {
    pub reads: u64,
    pub arena_bytes: u64,
    /// Offsets plus flags
    pub side_bytes: u64,
}

impl MemoryEstimate {
    /// Arena words to reserve up front, with 10% headroom.
    pub fn reserve_words(&self) -> usize {
        (self.arena_bytes / 4 * 110 / 100) as usize
    }
}

pub fn estimate_memory(paths: &[PathBuf], cfg: &ReadFilterConfig) -> Result<MemoryEstimate> {
    let mut est = MemoryEstimate::default();
    for path in paths {
        let file = estimate_file(path, cfg)?;
        debug!(
            "{}: ~{} reads, mean trimmed length {}",
            path.display(),
            file.reads,
            file.mean_len
        );
        est.reads += file.reads;
        est.arena_bytes += file.reads * file.bytes_per_read;
    }
    est.side_bytes = est.reads * 12;
    if est.reads < MIN_WORKING_SET {
        return Err(ArtredError::InsufficientData {
            stage: "estimating input size",
            found: est.reads,
            required: MIN_WORKING_SET,
        });
    }
    Ok(est)
}

/// Totals of a raw load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub files: usize,
    pub parsed: u64,
    pub underlength: u64,
    pub excess_ns: u64,
    pub low_quality: u64,
    pub contaminant: u64,
    pub accepted: u64,
}

impl LoadSummary {
    fn add(&mut self, c: &FileCounts) {
        self.files += 1;
        self.parsed += c.parsed as u64;
        self.underlength += c.underlength as u64;
        self.excess_ns += c.excess_ns as u64;
        self.low_quality += c.low_quality as u64;
        self.contaminant += c.contaminant as u64;
        self.accepted += c.accepted as u64;
    }
}

fn expand_all(specs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for spec in specs {
        out.extend(expand_input_spec(spec)?);
    }
    Ok(out)
}

/// Expand the configured inputs, size the arena and load every file.
pub fn load_raw_inputs(
    cfg: &ReduceConfig,
    store: &mut PackedStore,
    files: &mut SourceFiles,
    contaminants: Option<&dyn ContaminantFilter>,
) -> Result<LoadSummary> {
    let start = Instant::now();
    let pe1 = expand_all(&cfg.inputs)?;
    let pe2 = expand_all(&cfg.pe2_inputs)?;
    if pe1.is_empty() {
        return Err(ArtredError::InsufficientData { stage: "expanding inputs", found: 0, required: 1 });
    }
    if cfg.is_paired() && pe1.len() != pe2.len() {
        return Err(ArtredError::InsufficientData {
            stage: "pairing mate files",
            found: pe1.len().min(pe2.len()) as u64,
            required: pe1.len().max(pe2.len()) as u64,
        });
    }

    let all: Vec<PathBuf> = pe1.iter().chain(pe2.iter()).cloned().collect();
    let est = estimate_memory(&all, &cfg.filter)?;
    info!(
        "Estimated {} reads needing {} MiB of packed arena",
        est.reads,
        (est.arena_bytes + est.side_bytes) >> 20
    );
    store.reserve_words(est.reserve_words())?;

    let loader = ReadLoader::new(&cfg.filter, contaminants);
    let mut summary = LoadSummary::default();
    if cfg.is_paired() {
        for (p1, p2) in pe1.iter().zip(&pe2) {
            let id1 = files.register(p1, 0)?;
            let id2 = files.register(p2, id1)?;
            if let Some(f) = files.get_mut(id1) {
                f.pe_file_id = id2;
            }
            let mut r1 = FastxReader::from_path(p1)?;
            let mut r2 = FastxReader::from_path(p2)?;
            let (c1, c2) = loader.load_paired(store, (id1, id2), &mut r1, &mut r2, p2)?;
            log_file(p1, &c1);
            log_file(p2, &c2);
            files.record(id1, &c1);
            files.record(id2, &c2);
            summary.add(&c1);
            summary.add(&c2);
        }
    } else {
        for p in &pe1 {
            let id = files.register(p, 0)?;
            let mut r = FastxReader::from_path(p)?;
            let c = loader.load_single(store, id, &mut r)?;
            log_file(p, &c);
            files.record(id, &c);
            summary.add(&c);
        }
    }
    info!(
        "Loaded {} of {} reads from {} files in {:.2}s",
        summary.accepted,
        summary.parsed,
        summary.files,
        start.elapsed().as_secs_f64()
    );
    Ok(summary)
}

fn log_file(path: &Path, c: &FileCounts) {
    info!(
        "{}: parsed {}, accepted {}, underlength {}, excess Ns {}, low quality {}, contaminant {}",
        path.display(),
        c.parsed,
        c.accepted,
        c.underlength,
        c.excess_ns,
        c.low_quality,
        c.contaminant
    );
}
