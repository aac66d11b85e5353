//! Flank overlap detection in three strand phases.
//!
//! For each probe the detector slides a boundary across the probe, takes the
//! bases beyond it as a flank and looks that flank up against the first words
//! of every other sequence. Any exact hit marks the probe as overlapping and
//! the hit as overlapped, on the ends implied by the phase.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

use crate::concurrency::{run_workers, worker_threads, RangeAllocator, HEARTBEAT_INTERVAL};
use crate::index::SuffixIndex;
use crate::packed::word::{reverse_complement_in_place, sub_sequence, SeqWord, EOS};
use crate::packed::{FlagBatch, PackedStore, SeqFlags};

pub const MIN_OVERLAP_FLOOR: u32 = 25;
pub const MAX_OVERLAP_CEILING: u32 = 150;
pub const MIN_FLANK_FLOOR: u32 = 1;
pub const MAX_FLANK_CEILING: u32 = 25;

/// Strand relationship examined by one pass.
///
/// The phases must run in declaration order; the last one expects the whole
/// arena to have been reverse complemented and re-indexed beforehand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlapPhase {
    /// Probe 3' flank against target 5' flank
    SenseToSense,
    /// Reverse complemented probe, i.e. probe 5' flank against target 5' flank
    AntisenseToSense,
    /// Probe 3' flank against the 3' flank of a reverse complemented target
    SenseToAntisense,
}

impl OverlapPhase {
    pub fn probe_flag(self) -> SeqFlags {
        match self {
            OverlapPhase::SenseToSense | OverlapPhase::SenseToAntisense => SeqFlags::THREE_PRIME,
            OverlapPhase::AntisenseToSense => SeqFlags::FIVE_PRIME,
        }
    }

    pub fn target_flag(self) -> SeqFlags {
        match self {
            OverlapPhase::SenseToSense | OverlapPhase::AntisenseToSense => SeqFlags::FIVE_PRIME,
            OverlapPhase::SenseToAntisense => SeqFlags::THREE_PRIME,
        }
    }

    fn revcpl_probe(self) -> bool {
        self != OverlapPhase::SenseToSense
    }

    pub fn label(self) -> &'static str {
        match self {
            OverlapPhase::SenseToSense => "Sense overlap Sense (3' - 5')",
            OverlapPhase::AntisenseToSense => "Antisense overlap Sense (5' - 5')",
            OverlapPhase::SenseToAntisense => "Sense overlap Antisense (3' - 3')",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OverlapOptions {
    /// Minimum overlap in bases; 0 derives 80% of each probe's length
    pub min_overlap: u32,
    /// Minimum bases left outside the overlap on the probe
    pub min_flank: u32,
    pub threads: usize,
}

impl Default for OverlapOptions {
    fn default() -> Self {
        Self { min_overlap: 0, min_flank: MIN_FLANK_FLOOR, threads: 1 }
    }
}

/// Minimum overlap for a probe of `len` bases, clamped to 25..=150.
pub fn resolve_min_overlap(requested: u32, len: u32) -> u32 {
    let base = if requested == 0 { (79 + len * 80) / 100 } else { requested };
    base.clamp(MIN_OVERLAP_FLOOR, MAX_OVERLAP_CEILING)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OverlapReport {
    /// Sequences long enough to probe
    pub probes: u64,
    /// Probes newly given the phase's probe flag
    pub overlapping: u64,
    /// Targets newly given the phase's target flag
    pub overlapped: u64,
    /// Identical copies of a probe classified along with it
    pub propagated: u64,
}

impl OverlapReport {
    fn add(&mut self, other: OverlapReport) {
        self.probes += other.probes;
        self.overlapping += other.overlapping;
        self.overlapped += other.overlapped;
        self.propagated += other.propagated;
    }
}

/// Run one phase over every sequence in `store`.
pub fn identify_overlaps(
    store: &PackedStore,
    index: &SuffixIndex,
    phase: OverlapPhase,
    opts: &OverlapOptions,
) -> OverlapReport {
    let start = Instant::now();
    let num_seqs = store.num_seqs();
    let flags = store.flags();
    flags.update_all(SeqFlags::NONE, SeqFlags::NO_PROC);

    let threads = worker_threads(num_seqs, opts.threads.max(1));
    let alloc = RangeAllocator::new(num_seqs, threads);
    let processed = AtomicU64::new(0);
    let overlapping = AtomicU64::new(0);
    info!("{}: probing {} sequences using {} threads", phase.label(), num_seqs, threads);

    let tallies = run_workers(
        threads,
        HEARTBEAT_INTERVAL,
        |_| overlap_worker(store, index, phase, opts, &alloc, &processed, &overlapping),
        || {
            info!(
                "{}: {} sequences processed, {} overlapping",
                phase.label(),
                processed.load(Ordering::Relaxed),
                overlapping.load(Ordering::Relaxed)
            )
        },
    );
    let mut report = OverlapReport::default();
    for tally in tallies {
        report.add(tally);
    }

    flags.update_all(SeqFlags::NONE, SeqFlags::NO_PROC);
    let retained = flags.count_with(SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME);
    info!(
        "{}: {} overlapping, {} overlapped, {} provisionally retained, in {:.2}s",
        phase.label(),
        report.overlapping,
        report.overlapped,
        retained,
        start.elapsed().as_secs_f64()
    );
    report
}

fn overlap_worker(
    store: &PackedStore,
    index: &SuffixIndex,
    phase: OverlapPhase,
    opts: &OverlapOptions,
    alloc: &RangeAllocator,
    processed: &AtomicU64,
    overlapping: &AtomicU64,
) -> OverlapReport {
    let words = store.words();
    let flags = store.flags();
    let probe_flag = phase.probe_flag();
    let target_flag = phase.target_flag();
    let min_flank = opts.min_flank.clamp(MIN_FLANK_FLOOR, MAX_FLANK_CEILING) as usize;

    let mut tally = OverlapReport::default();
    let mut batch = FlagBatch::new();
    let mut probe: Vec<SeqWord> = Vec::new();
    let mut flank: Vec<SeqWord> = Vec::new();

    while let Some(range) = alloc.claim() {
        let claimed = (range.end() - range.start() + 1) as u64;
        let before = tally.overlapping;
        for id in range {
            if flags.get(id).contains(SeqFlags::NO_PROC) {
                continue;
            }
            let (Some(payload), Some(len)) = (store.payload(id), store.seq_len(id)) else {
                continue;
            };
            let len = len as usize;
            let min_overlap = resolve_min_overlap(opts.min_overlap, len as u32) as usize;
            if min_overlap + min_flank > len {
                continue;
            }
            tally.probes += 1;

            probe.clear();
            probe.extend_from_slice(payload);
            if phase.revcpl_probe() {
                reverse_complement_in_place(&mut probe, len);
            }
            probe.push(EOS);

            let mut has_probe_flag = flags.get(id).contains(probe_flag);
            let mut added = false;
            for flank_ofs in min_flank..=len - min_overlap {
                let flank_len = len - flank_ofs;
                flank.clear();
                sub_sequence(&probe, flank_ofs, flank_len, &mut flank);
                flank.push(EOS);

                for pos in index.exact_matches(words, &flank, flank_len) {
                    let Ok(target) = store.header_of_payload(pos) else {
                        continue;
                    };
                    if target.id == id {
                        continue;
                    }
                    let target_has = flags.get(target.id).contains(target_flag);
                    if has_probe_flag && target_has {
                        continue;
                    }
                    if !has_probe_flag {
                        has_probe_flag = true;
                        added = true;
                        tally.overlapping += 1;
                    }
                    if !target_has && flags.set_if_absent(target.id, target_flag) {
                        tally.overlapped += 1;
                    }
                }
            }

            if added {
                batch.push(flags, id, probe_flag | SeqFlags::NO_PROC, SeqFlags::NONE);
                // identical copies would find exactly the same overlaps
                for pos in index.exact_matches(words, payload, len) {
                    let Ok(copy) = store.header_of_payload(pos) else {
                        continue;
                    };
                    if copy.id == id
                        || copy.len as usize != len
                        || flags.get(copy.id).contains(SeqFlags::NO_PROC)
                    {
                        continue;
                    }
                    flags.update(copy.id, probe_flag | SeqFlags::NO_PROC, SeqFlags::NONE);
                    tally.propagated += 1;
                }
            }
        }
        batch.flush(flags);
        processed.fetch_add(claimed, Ordering::Relaxed);
        overlapping.fetch_add(tally.overlapping - before, Ordering::Relaxed);
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexScope;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_seq(rng: &mut StdRng, len: usize) -> String {
        (0..len).map(|_| ['A', 'C', 'G', 'T'][rng.random_range(0..4)]).collect()
    }

    fn revcomp(s: &str) -> String {
        s.bytes()
            .rev()
            .map(|b| match b {
                b'A' => 'T',
                b'C' => 'G',
                b'G' => 'C',
                _ => 'A',
            })
            .collect()
    }

    fn store_of(seqs: &[String]) -> PackedStore {
        let mut store = PackedStore::new();
        for s in seqs {
            store.append(1, SeqFlags::NONE, s.as_bytes()).unwrap();
        }
        store
    }

    fn run(store: &PackedStore, phase: OverlapPhase, min_overlap: u32, min_flank: u32) -> OverlapReport {
        let index = SuffixIndex::build(store, IndexScope::first_word()).unwrap();
        let opts = OverlapOptions { min_overlap, min_flank, threads: 1 };
        identify_overlaps(store, &index, phase, &opts)
    }

    #[test]
    fn test_resolve_min_overlap() {
        assert_eq!(resolve_min_overlap(0, 100), 80);
        assert_eq!(resolve_min_overlap(0, 20), 25);
        assert_eq!(resolve_min_overlap(0, 1000), 150);
        assert_eq!(resolve_min_overlap(20, 100), 25);
        assert_eq!(resolve_min_overlap(60, 100), 60);
    }

    #[test]
    fn test_shared_flank_sense_to_sense() {
        let first = format!("{}{}", "A".repeat(50), "C".repeat(25));
        let second = format!("{}{}", "C".repeat(25), "G".repeat(50));
        let store = store_of(&[first, second]);
        let report = run(&store, OverlapPhase::SenseToSense, 20, 5);
        let flags = store.flags();
        assert!(flags.get(1).contains(SeqFlags::THREE_PRIME));
        assert!(flags.get(2).contains(SeqFlags::FIVE_PRIME));
        assert!(!flags.get(1).contains(SeqFlags::FIVE_PRIME));
        assert!(!flags.get(2).contains(SeqFlags::THREE_PRIME));
        assert_eq!((report.overlapping, report.overlapped), (1, 1));
        assert_eq!(flags.count_with(SeqFlags::NO_PROC), 0);
    }

    /// Two 100-base reads sharing exactly `len` bases on the ends `phase`
    /// compares, laid out the way the lifecycle presents them to that phase.
    fn overlapping_pair(rng: &mut StdRng, phase: OverlapPhase, len: usize) -> PackedStore {
        let probe = random_seq(rng, 100);
        let target = match phase {
            OverlapPhase::SenseToSense => format!("{}{}", &probe[100 - len..], random_seq(rng, 100 - len)),
            OverlapPhase::AntisenseToSense => {
                format!("{}{}", &revcomp(&probe)[100 - len..], random_seq(rng, 100 - len))
            }
            OverlapPhase::SenseToAntisense => format!("{}{}", random_seq(rng, 100 - len), revcomp(&probe[100 - len..])),
        };
        let mut store = store_of(&[probe, target]);
        if phase == OverlapPhase::SenseToAntisense {
            store.reverse_complement_all();
        }
        store
    }

    #[test]
    fn test_whole_word_overlaps_every_phase() {
        let mut rng = StdRng::seed_from_u64(16);
        for phase in [OverlapPhase::SenseToSense, OverlapPhase::AntisenseToSense, OverlapPhase::SenseToAntisense] {
            for len in [30, 45, 60] {
                let store = overlapping_pair(&mut rng, phase, len);
                let report = run(&store, phase, len as u32, 1);
                assert!(report.overlapping >= 1, "{phase:?} len={len}");
                assert!(store.flags().get(1).contains(phase.probe_flag()), "{phase:?} len={len}");
                assert!(store.flags().get(2).contains(phase.target_flag()), "{phase:?} len={len}");
            }
        }
    }

    #[test]
    fn test_fifteen_base_overlap_below_floor() {
        let mut rng = StdRng::seed_from_u64(17);
        for phase in [OverlapPhase::SenseToSense, OverlapPhase::AntisenseToSense, OverlapPhase::SenseToAntisense] {
            let store = overlapping_pair(&mut rng, phase, 15);
            let report = run(&store, phase, 15, 1);
            assert_eq!(report.overlapping, 0, "{phase:?}");
        }
    }

    #[test]
    fn test_overlap_length_boundary() {
        let mut rng = StdRng::seed_from_u64(11);
        let probe = random_seq(&mut rng, 100);
        let exact = format!("{}{}", &probe[70..], random_seq(&mut rng, 70));
        let store = store_of(&[probe.clone(), exact]);
        run(&store, OverlapPhase::SenseToSense, 30, 1);
        assert!(store.flags().get(1).contains(SeqFlags::THREE_PRIME));
        assert!(store.flags().get(2).contains(SeqFlags::FIVE_PRIME));

        let short = format!("{}{}", &probe[71..], random_seq(&mut rng, 71));
        let store = store_of(&[probe, short]);
        let report = run(&store, OverlapPhase::SenseToSense, 30, 1);
        assert_eq!(report.overlapping, 0);
        assert!(!store.flags().get(2).contains(SeqFlags::FIVE_PRIME));
    }

    #[test]
    fn test_flank_must_remain() {
        let mut rng = StdRng::seed_from_u64(12);
        let probe = random_seq(&mut rng, 60);
        // target starts with the probe's last 59 bases: flank of one base
        let target = format!("{}{}", &probe[1..], random_seq(&mut rng, 20));
        let store = store_of(&[probe.clone(), target.clone()]);
        run(&store, OverlapPhase::SenseToSense, 40, 1);
        assert!(store.flags().get(1).contains(SeqFlags::THREE_PRIME));

        let store = store_of(&[probe, target]);
        run(&store, OverlapPhase::SenseToSense, 40, 2);
        // the 58-base flank at offset 2 still matches nothing longer than the target's start
        assert!(!store.flags().get(1).contains(SeqFlags::THREE_PRIME));
    }

    #[test]
    fn test_antisense_to_sense() {
        let mut rng = StdRng::seed_from_u64(13);
        let probe = random_seq(&mut rng, 80);
        let target = format!("{}{}", &revcomp(&probe)[40..], random_seq(&mut rng, 40));
        let store = store_of(&[probe, target]);
        let report = run(&store, OverlapPhase::AntisenseToSense, 30, 1);
        assert_eq!(report.overlapping, 1);
        assert!(store.flags().get(1).contains(SeqFlags::FIVE_PRIME));
        assert!(store.flags().get(2).contains(SeqFlags::FIVE_PRIME));
    }

    #[test]
    fn test_identical_probes_share_classification() {
        let mut rng = StdRng::seed_from_u64(14);
        let probe = random_seq(&mut rng, 90);
        let target = format!("{}{}", &probe[50..], random_seq(&mut rng, 50));
        let store = store_of(&[probe.clone(), probe, target]);
        let report = run(&store, OverlapPhase::SenseToSense, 30, 1);
        assert_eq!(report.propagated, 1);
        assert_eq!(report.overlapping, 1);
        assert!(store.flags().get(2).contains(SeqFlags::THREE_PRIME));
        assert_eq!(store.flags().count_with(SeqFlags::NO_PROC), 0);
    }

    #[test]
    fn test_short_sequences_not_probed() {
        let mut rng = StdRng::seed_from_u64(15);
        let store = store_of(&[random_seq(&mut rng, 25), random_seq(&mut rng, 25)]);
        let report = run(&store, OverlapPhase::SenseToSense, 25, 1);
        assert_eq!(report.probes, 0);
    }
}
