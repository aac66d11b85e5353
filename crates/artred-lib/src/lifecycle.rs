//! Run orchestration: load or resume a working set, deduplicate, remove
//! non-overlapping reads and persist what is retained.
//!
//! The working set sits behind one readers/writer lock. Detection passes hold
//! it shared for their whole run and mutate only the atomic flag table;
//! structural steps (loading, compaction, whole-arena reverse complementing,
//! index rebuilds) take it exclusively between passes.

use std::path::Path;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::checkpoint::{read_checkpoint, write_checkpoint};
use crate::cli::{OutputMode, ReduceConfig};
use crate::collab::{ContaminantFilter, FlankContaminants, NullSink, ResultsSink};
use crate::dedup::{identify_duplicates, propagate_to_mates, DedupOptions, DedupReport};
use crate::error::{ArtredError, Result};
use crate::export::{write_dup_distribution, write_fasta};
use crate::index::{IndexScope, SuffixIndex};
use crate::overlap::{identify_overlaps, OverlapOptions, OverlapPhase, MAX_OVERLAP_CEILING, MIN_OVERLAP_FLOOR};
use crate::packed::{CompactStats, PackedStore, Retain, SeqFlags};
use crate::reads::{load_raw_inputs, SourceFiles, MIN_WORKING_SET};

/// Most overlap removal passes accepted by [`ArtefactReducer::remove_non_overlaps`]
pub const MAX_OVERLAP_PASSES: u32 = 5;

/// Aggregate counters describing the current working set, persisted with checkpoints.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionState {
    pub is_paired: bool,
    pub tot_parsed: u32,
    pub tot_underlength: u32,
    pub tot_excess_ns: u32,
    pub num_duplicates: u32,
    pub num_overlapping: u32,
    pub num_overlapped: u64,
    /// Sequences originally loaded
    pub tot_seqs: u32,
    /// Sequences currently held
    pub num_seqs: u32,
    pub num_pe1: u32,
    pub num_pe2: u32,
    pub total_len: u64,
    pub mean_len: f64,
    pub min_len: u32,
    pub max_len: u32,
}

impl CollectionState {
    pub fn from_store(store: &PackedStore, is_paired: bool) -> Self {
        let mut state = Self { is_paired, ..Default::default() };
        state.refresh(store);
        state.tot_seqs = state.num_seqs;
        state
    }

    /// Recount sequences and lengths after the store changed.
    pub fn refresh(&mut self, store: &PackedStore) {
        let stats = store.stats();
        self.num_seqs = stats.num_seqs;
        self.num_pe2 = if self.is_paired { store.flags().count_with(SeqFlags::PE2) as u32 } else { 0 };
        self.num_pe1 = self.num_seqs - self.num_pe2;
        self.total_len = stats.total_len;
        self.mean_len = stats.mean_len;
        self.min_len = stats.min_len;
        self.max_len = stats.max_len;
    }
}

/// Sequence counts at each stage of [`ArtefactReducer::process`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub loaded: u32,
    pub deduped: Option<u32>,
    pub retained: u32,
    /// Working set came from a checkpoint rather than raw reads
    pub resumed: bool,
}

#[derive(Debug)]
struct Working {
    store: PackedStore,
    index: Option<SuffixIndex>,
    files: SourceFiles,
    state: CollectionState,
}

impl Working {
    fn new(store: PackedStore, files: SourceFiles, state: CollectionState) -> Self {
        Self { store, index: None, files, state }
    }

    /// Rebuild the first-word index unless it already matches the arena.
    fn ensure_index(&mut self) -> Result<()> {
        if !self.index.as_ref().is_some_and(|i| i.is_current(&self.store)) {
            self.index = Some(SuffixIndex::build(&self.store, IndexScope::first_word())?);
        }
        Ok(())
    }

    fn index(&self) -> Result<&SuffixIndex> {
        self.index
            .as_ref()
            .filter(|i| i.is_current(&self.store))
            .ok_or_else(|| ArtredError::invalid("index", "suffix index is stale"))
    }

    fn require_working_set(&self, stage: &'static str) -> Result<()> {
        let found = self.state.num_pe1 as u64;
        if found < MIN_WORKING_SET {
            return Err(ArtredError::InsufficientData { stage, found, required: MIN_WORKING_SET });
        }
        Ok(())
    }

    fn remove_marked(
        &mut self,
        removal: SeqFlags,
        all_required: SeqFlags,
        all_optional: SeqFlags,
    ) -> Result<CompactStats> {
        let start = Instant::now();
        self.store.sync_header_flags();
        let both_ends = SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME;
        let stats = self.store.compact(|h| {
            let f = h.flags;
            if f.intersects(removal)
                || (!all_required.is_empty() && !f.contains(all_required))
                || (!all_optional.is_empty() && !f.intersects(all_optional))
            {
                return Retain::Drop;
            }
            if all_optional.is_empty() || f.contains(both_ends) {
                return Retain::Keep;
            }
            // overlapped at one end only: keep the overlapping part
            let trim_to = (h.len as u64 * f.overlap_pct() as u64 / 100) as u32;
            if trim_to == 0 {
                return Retain::Drop;
            }
            let excess = h.len - trim_to;
            let flags = f | both_ends;
            if f.contains(SeqFlags::FIVE_PRIME) {
                Retain::Trim { trim5: 0, trim3: excess, flags }
            } else {
                Retain::Trim { trim5: excess, trim3: 0, flags }
            }
        })?;
        self.index = None;
        self.state.refresh(&self.store);
        info!(
            "Removed {} sequences, {} remaining, in {:.2}s",
            stats.removed,
            stats.remaining,
            start.elapsed().as_secs_f64()
        );
        if stats.remaining == 0 {
            warn!("No sequences remain after removal");
        }
        Ok(stats)
    }
}

/// Drives artefact reduction over one working set.
pub struct ArtefactReducer {
    cfg: ReduceConfig,
    working: RwLock<Working>,
    sink: Mutex<Box<dyn ResultsSink>>,
    contaminants: Option<Box<dyn ContaminantFilter>>,
}

impl ArtefactReducer {
    /// Validate `cfg` and load any configured contaminant sequences.
    pub fn new(cfg: ReduceConfig) -> Result<Self> {
        cfg.validate()?;
        let contaminants: Option<Box<dyn ContaminantFilter>> = match &cfg.contaminants {
            Some(path) => {
                let filter = FlankContaminants::from_fasta(path)?;
                info!("Loaded {} contaminant sequences from {}", filter.len(), path.display());
                Some(Box::new(filter))
            }
            None => None,
        };
        let paired = cfg.is_paired();
        Ok(Self {
            cfg,
            working: RwLock::new(Working::new(
                PackedStore::new(),
                SourceFiles::new(),
                CollectionState { is_paired: paired, ..Default::default() },
            )),
            sink: Mutex::new(Box::new(NullSink)),
            contaminants,
        })
    }

    /// Reducer over an already populated store; `cfg` is not validated.
    pub fn from_store(cfg: ReduceConfig, store: PackedStore, files: SourceFiles, paired: bool) -> Self {
        let state = CollectionState::from_store(&store, paired);
        Self {
            cfg,
            working: RwLock::new(Working::new(store, files, state)),
            sink: Mutex::new(Box::new(NullSink)),
            contaminants: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ResultsSink>) -> Self {
        self.sink = Mutex::new(sink);
        self
    }

    pub fn with_contaminants(mut self, filter: Box<dyn ContaminantFilter>) -> Self {
        self.contaminants = Some(filter);
        self
    }

    pub fn config(&self) -> &ReduceConfig {
        &self.cfg
    }

    pub fn state(&self) -> CollectionState {
        self.working.read().state.clone()
    }

    pub fn num_seqs(&self) -> u32 {
        self.working.read().store.num_seqs()
    }

    /// Run `f` against the store under a shared lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&PackedStore) -> R) -> R {
        f(&self.working.read().store)
    }

    fn is_paired(&self) -> bool {
        self.working.read().state.is_paired
    }

    fn report(&self, key: &str, value: u64) {
        self.sink.lock().add_count(key, value);
    }

    /// Report current counts as `SE<stage>` or `PE1<stage>`/`PE2<stage>`.
    fn report_counts(&self, stage: &str) {
        let state = self.state();
        let mut sink = self.sink.lock();
        if state.is_paired {
            sink.add_count(&format!("PE1Reads{stage}"), state.num_pe1 as u64);
            sink.add_count(&format!("PE2Reads{stage}"), state.num_pe2 as u64);
        } else {
            sink.add_count(&format!("SEReads{stage}"), state.num_seqs as u64);
        }
    }

    /// Full run as configured.
    pub fn process(&self) -> Result<RunSummary> {
        let start = Instant::now();
        let threads = self.cfg.resolved_threads();
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .ok(); // Ignore error if already initialized
        info!("Using up to {} threads", threads);
        if self.cfg.mode == OutputMode::PackedToFasta {
            return self.packed_to_fasta();
        }

        let resumed = self.load_working_set()?;
        {
            let w = self.working.read();
            self.report("SEReadsParsed", w.state.tot_parsed as u64);
            self.report("SEReadsUnderlength", w.state.tot_underlength as u64);
            self.report("SEReadsExcessNs", w.state.tot_excess_ns as u64);
        }
        self.report_counts("Loaded");
        let loaded = self.num_seqs();
        self.working.read().require_working_set("after loading")?;

        let deduped = self.reduce()?;
        let retained = self.num_seqs();
        self.save()?;
        info!(
            "Artefact reduction retained {} of {} sequences in {:.2}s",
            retained,
            loaded,
            start.elapsed().as_secs_f64()
        );
        Ok(RunSummary { loaded, deduped, retained, resumed })
    }

    /// Deduplicate (unless disabled) then remove non-overlapping sequences
    /// (unless `min_overlap` is -1). Returns the count after deduplication.
    pub fn reduce(&self) -> Result<Option<u32>> {
        let mean_len = self.working.read().state.mean_len;
        let min_overlap = match self.cfg.min_overlap {
            -1 => None,
            0 => Some((79 + (mean_len as u32) * 80) / 100),
            n => Some(n as u32),
        }
        .map(|n| n.clamp(MIN_OVERLAP_FLOOR, MAX_OVERLAP_CEILING));

        self.working.write().ensure_index()?;

        let mut deduped = None;
        if !self.cfg.no_dedupe {
            self.remove_duplicates()?;
            self.report_counts("Deduped");
            let w = self.working.read();
            w.require_working_set("after deduplication")?;
            deduped = Some(w.store.num_seqs());
        }
        self.working.write().ensure_index()?;

        if let Some(min_overlap) = min_overlap {
            self.remove_non_overlaps(min_overlap, self.cfg.iterative_passes)?;
        }
        self.report_counts("Retained");
        Ok(deduped)
    }

    /// Resume from the checkpoint if possible, otherwise load raw reads (and
    /// write the checkpoint when one is configured). True when resumed.
    pub fn load_working_set(&self) -> Result<bool> {
        if let Some(path) = &self.cfg.checkpoint {
            if path.is_file() {
                match read_checkpoint(path) {
                    Ok(cp) => {
                        let mut working = Working::new(cp.store, cp.files, cp.state);
                        working.state.refresh(&working.store);
                        *self.working.write() = working;
                        return Ok(true);
                    }
                    Err(e) if self.cfg.inputs.is_empty() => {
                        return Err(ArtredError::io(
                            path,
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
                        ));
                    }
                    Err(e) => warn!("Unable to resume from {}: {}; reloading raw reads", path.display(), e),
                }
            }
        }
        if self.cfg.inputs.is_empty() {
            return Err(ArtredError::invalid("inputs", "no checkpoint available and no raw inputs"));
        }

        let mut w = self.working.write();
        let mut store = PackedStore::new();
        let mut files = SourceFiles::new();
        let summary = load_raw_inputs(&self.cfg, &mut store, &mut files, self.contaminants.as_deref())?;
        let mut state = CollectionState::from_store(&store, self.cfg.is_paired());
        state.tot_parsed = summary.parsed as u32;
        state.tot_underlength = summary.underlength as u32;
        state.tot_excess_ns = summary.excess_ns as u32;
        *w = Working::new(store, files, state);

        if let Some(path) = &self.cfg.checkpoint {
            let Working { store, files, state, .. } = &mut *w;
            write_checkpoint(path, store, files, state)?;
        }
        Ok(false)
    }

    /// Mark and remove every duplicate after the first of its cluster.
    pub fn remove_duplicates(&self) -> Result<DedupReport> {
        self.working.write().ensure_index()?;
        let opts = DedupOptions {
            paired: self.is_paired(),
            independent_pairs: self.cfg.independent_pairs,
            strand_specific: self.cfg.strand_specific,
            threads: self.cfg.resolved_threads(),
        };
        let report = {
            let w = self.working.read();
            identify_duplicates(&w.store, w.index()?, &opts)
        };

        if let Some(prefix) = &self.cfg.dedup_dist {
            let path = write_dup_distribution(prefix, &report)?;
            info!("Duplicate distribution written to {}", path.display());
        }
        {
            let mut sink = self.sink.lock();
            sink.add_count("ReadsDuplicated", report.duplicates);
            sink.add_count("ReadsMaxDuplicate", report.max_copies() as u64);
            for (copies, instances) in report.distribution() {
                sink.add_bucket("DupReadsDist", copies as u64, instances);
            }
        }

        let mut w = self.working.write();
        if opts.paired && !opts.independent_pairs {
            propagate_to_mates(&w.store, SeqFlags::NTH_DUP);
        }
        w.state.num_duplicates += report.duplicates as u32;
        w.remove_marked(SeqFlags::NTH_DUP | SeqFlags::REMOVE, SeqFlags::NONE, SeqFlags::NONE)?;
        Ok(report)
    }

    /// Remove sequences lacking an exact overlap at either end, over
    /// `passes` rounds of detection and removal.
    pub fn remove_non_overlaps(&self, min_overlap: u32, passes: u32) -> Result<()> {
        if !(MIN_OVERLAP_FLOOR..=MAX_OVERLAP_CEILING).contains(&min_overlap) {
            return Err(ArtredError::invalid("min_overlap", format!("{min_overlap} not in 25..=150")));
        }
        if !(1..=MAX_OVERLAP_PASSES).contains(&passes) {
            return Err(ArtredError::invalid("passes", format!("{passes} not in 1..={MAX_OVERLAP_PASSES}")));
        }
        let opts = OverlapOptions {
            min_overlap,
            min_flank: self.cfg.min_flank,
            threads: self.cfg.resolved_threads(),
        };
        let both_ends = SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME;

        for pass in 1..=passes {
            info!("Identification of non-overlapping sequences, pass {}", pass);
            {
                let mut w = self.working.write();
                if pass > 1 {
                    w.store.reset_flags(SeqFlags::PAIRING);
                }
                w.ensure_index()?;
            }
            for phase in [OverlapPhase::SenseToSense, OverlapPhase::AntisenseToSense] {
                self.overlap_phase(phase, &opts)?;
            }
            {
                let mut w = self.working.write();
                w.store.reverse_complement_all();
                w.ensure_index()?;
            }
            let phase3 = self.overlap_phase(OverlapPhase::SenseToAntisense, &opts);
            // restore orientation even if the phase failed
            self.working.write().store.reverse_complement_all();
            phase3?;

            let mut w = self.working.write();
            if w.state.is_paired && !self.cfg.independent_pairs {
                let flags = w.store.flags();
                let mut id = 1;
                while id < w.store.num_seqs() {
                    let (a, b) = (flags.get(id), flags.get(id + 1));
                    if a.contains(SeqFlags::PE) && b.contains(SeqFlags::PE2) {
                        if !a.contains(both_ends) || !b.contains(both_ends) {
                            flags.update(id, SeqFlags::REMOVE, SeqFlags::NONE);
                            flags.update(id + 1, SeqFlags::REMOVE, SeqFlags::NONE);
                        }
                        id += 2;
                    } else {
                        id += 1;
                    }
                }
                propagate_to_mates(&w.store, SeqFlags::REMOVE);
                propagate_to_mates(&w.store, SeqFlags::NTH_DUP);
            }
            w.remove_marked(SeqFlags::REMOVE | SeqFlags::NTH_DUP, both_ends, SeqFlags::NONE)?;
            info!("Removal of non-overlapping sequences completed, pass {}", pass);
        }
        Ok(())
    }

    fn overlap_phase(&self, phase: OverlapPhase, opts: &OverlapOptions) -> Result<()> {
        let report = {
            let w = self.working.read();
            identify_overlaps(&w.store, w.index()?, phase, opts)
        };
        let mut w = self.working.write();
        w.state.num_overlapping += report.overlapping as u32;
        w.state.num_overlapped += report.overlapped;
        Ok(())
    }

    /// Remove sequences carrying any `removal` flag, missing any of
    /// `all_required`, or (when non-empty) carrying none of `all_optional`.
    /// With `all_optional`, a sequence overlapped at one end only is trimmed
    /// to its recorded overlap percentage on that side.
    pub fn remove_marked(
        &self,
        removal: SeqFlags,
        all_required: SeqFlags,
        all_optional: SeqFlags,
    ) -> Result<CompactStats> {
        self.working.write().remove_marked(removal, all_required, all_optional)
    }

    /// Write the retained sequences in the configured output format.
    pub fn save(&self) -> Result<()> {
        let mut w = self.working.write();
        w.store.reset_flags(SeqFlags::PAIRING);
        match self.cfg.mode {
            OutputMode::Fasta | OutputMode::PackedToFasta => {
                let paired = w.state.is_paired;
                write_fasta(&w.store, &self.cfg.output, paired)?;
            }
            OutputMode::Packed => {
                let Working { store, files, state, .. } = &mut *w;
                write_checkpoint(&self.cfg.output, store, files, state)?;
            }
        }
        Ok(())
    }

    fn packed_to_fasta(&self) -> Result<RunSummary> {
        let path: &Path = self
            .cfg
            .inputs
            .first()
            .ok_or_else(|| ArtredError::invalid("inputs", "no packed file"))?;
        let cp = read_checkpoint(path)?;
        let loaded = cp.store.num_seqs();
        {
            let mut w = self.working.write();
            *w = Working::new(cp.store, cp.files, cp.state);
        }
        self.save()?;
        Ok(RunSummary { loaded, deduped: None, retained: loaded, resumed: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemorySink;
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use rand::{Rng, SeedableRng};

    fn random_seq(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| b"ACGT"[rng.random_range(0..4)]).collect()
    }

    fn reducer(seqs: &[Vec<u8>]) -> ArtefactReducer {
        let mut store = PackedStore::new();
        for s in seqs {
            store.append(1, SeqFlags::NONE, s).unwrap();
        }
        ArtefactReducer::from_store(ReduceConfig { threads: 1, ..Default::default() }, store, SourceFiles::new(), false)
    }

    #[test]
    fn test_identical_pair_keeps_lowest_id() {
        let mut rng = StdRng::seed_from_u64(1);
        let seq = random_seq(&mut rng, 60);
        let other = random_seq(&mut rng, 60);
        let r = reducer(&[seq.clone(), seq.clone(), other]);
        let report = r.remove_duplicates().unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(r.num_seqs(), 2);
        r.with_store(|s| assert_eq!(s.sequence(1).unwrap(), seq));
        assert_eq!(r.state().num_duplicates, 1);
    }

    #[test]
    fn test_remove_marked_required_and_removal() {
        let mut rng = StdRng::seed_from_u64(2);
        let seqs: Vec<Vec<u8>> = (0..4).map(|_| random_seq(&mut rng, 40)).collect();
        let r = reducer(&seqs);
        r.with_store(|s| {
            let both = SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME;
            s.flags().update(1, both, SeqFlags::NONE);
            s.flags().update(2, SeqFlags::FIVE_PRIME, SeqFlags::NONE);
            s.flags().update(3, both | SeqFlags::REMOVE, SeqFlags::NONE);
            s.flags().update(4, both, SeqFlags::NONE);
        });
        let stats = r
            .remove_marked(SeqFlags::REMOVE, SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME, SeqFlags::NONE)
            .unwrap();
        assert_eq!(stats, CompactStats { removed: 2, remaining: 2 });
        r.with_store(|s| {
            assert_eq!(s.sequence(1).unwrap(), seqs[0]);
            assert_eq!(s.sequence(2).unwrap(), seqs[3]);
            assert_eq!(s.header(2).unwrap().id, 2);
        });
    }

    #[test]
    fn test_remove_marked_trims_one_sided_overlaps() {
        let seq: Vec<u8> = b"ACGT".repeat(25);
        let r = reducer(&[seq.clone(), seq.clone(), seq.clone()]);
        r.with_store(|s| {
            s.flags().update(1, SeqFlags::FIVE_PRIME.with_overlap_pct(40), SeqFlags::NONE);
            s.flags().update(2, SeqFlags::THREE_PRIME.with_overlap_pct(30), SeqFlags::NONE);
            s.flags().update(3, SeqFlags::FIVE_PRIME, SeqFlags::NONE);
        });
        let optional = SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME;
        let stats = r.remove_marked(SeqFlags::NONE, SeqFlags::NONE, optional).unwrap();
        assert_eq!(stats.remaining, 2);
        r.with_store(|s| {
            assert_eq!(s.sequence(1).unwrap(), seq[..40].to_vec());
            assert_eq!(s.sequence(2).unwrap(), seq[70..].to_vec());
            assert!(s.flags().get(1).contains(optional));
        });
    }

    #[test]
    fn test_non_overlap_removal_keeps_chain_interior() {
        // a tiling of overlapping reads: only the interior reads overlap on both ends
        let mut rng = StdRng::seed_from_u64(3);
        let genome = random_seq(&mut rng, 400);
        let reads: Vec<Vec<u8>> = (0..7).map(|i| genome[i * 50..i * 50 + 100].to_vec()).collect();
        let r = reducer(&reads);
        r.remove_non_overlaps(30, 1).unwrap();
        assert_eq!(r.num_seqs(), 5);
        r.with_store(|s| {
            assert_eq!(s.sequence(1).unwrap(), reads[1]);
            assert_eq!(s.sequence(5).unwrap(), reads[5]);
        });
        assert!(r.state().num_overlapping > 0);
    }

    #[test]
    fn test_reverse_strand_overlaps_count() {
        // reads 2 and 4 are submitted reverse complemented
        let mut rng = StdRng::seed_from_u64(4);
        let genome = random_seq(&mut rng, 300);
        let revcpl = |s: &[u8]| -> Vec<u8> {
            s.iter()
                .rev()
                .map(|&b| match b {
                    b'A' => b'T',
                    b'C' => b'G',
                    b'G' => b'C',
                    _ => b'A',
                })
                .collect()
        };
        let mut reads: Vec<Vec<u8>> = (0..5).map(|i| genome[i * 50..i * 50 + 100].to_vec()).collect();
        reads[1] = revcpl(&reads[1]);
        reads[3] = revcpl(&reads[3]);
        let r = reducer(&reads);
        r.remove_non_overlaps(30, 1).unwrap();
        assert_eq!(r.num_seqs(), 3);
        r.with_store(|s| assert_eq!(s.sequence(2).unwrap(), reads[2]));
    }

    #[test]
    fn test_paired_removal_takes_both_mates() {
        let mut rng = StdRng::seed_from_u64(5);
        let genome = random_seq(&mut rng, 500);
        let mut store = PackedStore::new();
        // mate 1 reads tile the genome; mate 2 of the last pair is unrelated
        for i in 0..4 {
            store.append(1, SeqFlags::PE, &genome[i * 50..i * 50 + 100]).unwrap();
            let mate = if i == 3 { random_seq(&mut rng, 100) } else { genome[i * 50 + 10..i * 50 + 110].to_vec() };
            store.append(2, SeqFlags::PE | SeqFlags::PE2, &mate).unwrap();
        }
        let cfg = ReduceConfig { threads: 1, pe2_inputs: vec!["x".into()], ..Default::default() };
        let r = ArtefactReducer::from_store(cfg, store, SourceFiles::new(), true);
        r.remove_non_overlaps(30, 1).unwrap();
        assert_eq!(r.num_seqs() % 2, 0);
        r.with_store(|s| {
            for id in (1..=s.num_seqs()).step_by(2) {
                assert!(s.flags().get(id).contains(SeqFlags::PE));
                assert!(s.flags().get(id + 1).contains(SeqFlags::PE2));
            }
        });
        assert!(r.num_seqs() < 8);
    }

    #[test]
    fn test_remove_non_overlaps_rejects_ranges() {
        let r = reducer(&[b"ACGT".repeat(10)]);
        assert!(r.remove_non_overlaps(24, 1).is_err());
        assert!(r.remove_non_overlaps(30, 0).is_err());
        assert!(r.remove_non_overlaps(30, MAX_OVERLAP_PASSES + 1).is_err());
    }

    #[test]
    fn test_sink_receives_dedup_results() {
        let seq = b"ACGTTGCA".repeat(8);
        let sink = Arc::new(Mutex::new(MemorySink::default()));
        let r = reducer(&[seq.clone(), seq.clone(), seq]).with_sink(Box::new(sink.clone()));
        r.remove_duplicates().unwrap();
        r.report_counts("Deduped");
        let sink = sink.lock();
        assert_eq!(sink.count("ReadsDuplicated"), Some(2));
        assert_eq!(sink.count("ReadsMaxDuplicate"), Some(3));
        assert_eq!(sink.buckets["DupReadsDist"], vec![(3, 1)]);
        assert_eq!(sink.count("SEReadsDeduped"), Some(1));
    }

    #[test]
    fn test_collection_state_counts_mates() {
        let mut store = PackedStore::new();
        for _ in 0..3 {
            store.append(1, SeqFlags::PE, b"ACGTACGTAC").unwrap();
            store.append(2, SeqFlags::PE | SeqFlags::PE2, b"ACGTACGTACGT").unwrap();
        }
        let state = CollectionState::from_store(&store, true);
        assert_eq!((state.num_pe1, state.num_pe2, state.tot_seqs), (3, 3, 6));
        assert_eq!((state.min_len, state.max_len, state.total_len), (10, 12, 66));
    }
}
