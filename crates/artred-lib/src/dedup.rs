//! Exact duplicate detection.
//!
//! Every probe locates its own content in the first-word suffix index and
//! walks the run of identical entries, marking each matching sequence with a
//! larger id as [`SeqFlags::NTH_DUP`]. Marks only ever flow from a lower id to
//! a higher one, so each cluster keeps exactly its lowest-id member without
//! any coordination between workers.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use tracing::{info, warn};

use crate::concurrency::{run_workers, worker_threads, RangeAllocator, HEARTBEAT_INTERVAL};
use crate::index::SuffixIndex;
use crate::packed::word::{cmp_packed, reverse_complement_in_place, SeqWord, EOS};
use crate::packed::{mate_of, FlagBatch, PackedStore, SeqFlags};

/// Largest cluster size tracked individually in the histogram
pub const MAX_DUP_INSTANCES: usize = 2500;
const MAX_MISS_WARNINGS: u64 = 10;

#[derive(Clone, Copy, Debug, Default)]
pub struct DedupOptions {
    /// Sequences are paired-end, mate 1 on odd ids and mate 2 on the following even id
    pub paired: bool,
    /// Deduplicate each mate on its own instead of requiring both to match
    pub independent_pairs: bool,
    /// Compare the sense strand only
    pub strand_specific: bool,
    /// Configured worker threads (0 treated as 1)
    pub threads: usize,
}

#[derive(Clone, Debug)]
pub struct DedupReport {
    /// Sequences used as probes
    pub probes: u64,
    /// Sequences newly marked as duplicates, mates included
    pub duplicates: u64,
    /// `histogram[k]`: probes that found `k` further copies of themselves
    pub histogram: Vec<u64>,
    /// Probes whose own index entry could not be found
    pub self_misses: u64,
}

impl DedupReport {
    /// Largest cluster seen, counting the probe itself.
    pub fn max_copies(&self) -> usize {
        self.histogram.iter().rposition(|&n| n > 0).map_or(0, |k| k + 1)
    }

    /// `(copies, instances)` for every non-empty histogram bucket.
    pub fn distribution(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.histogram
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(k, &n)| (k + 1, n))
    }
}

struct WorkerTally {
    histogram: Vec<u64>,
    duplicates: u64,
    probes: u64,
}

/// Copy a payload into `dst` with a terminating sentinel, optionally reverse complemented.
fn load_probe(dst: &mut Vec<SeqWord>, payload: &[SeqWord], len: usize, revcpl: bool) {
    dst.clear();
    dst.extend_from_slice(payload);
    if revcpl {
        reverse_complement_in_place(dst, len);
    }
    dst.push(EOS);
}

/// Mark duplicates across the whole store; flags are written to the store's side array.
pub fn identify_duplicates(store: &PackedStore, index: &SuffixIndex, opts: &DedupOptions) -> DedupReport {
    let start = Instant::now();
    let num_seqs = store.num_seqs();
    let threads = worker_threads(num_seqs, opts.threads.max(1));
    let alloc = RangeAllocator::new(num_seqs, threads);
    let processed = AtomicU64::new(0);
    let misses = AtomicU64::new(0);
    info!(
        "Identifying duplicates over {} sequences using {} threads",
        num_seqs, threads
    );

    let tallies = run_workers(
        threads,
        HEARTBEAT_INTERVAL,
        |_| dedup_worker(store, index, opts, &alloc, &processed, &misses),
        || info!("Progress: {} sequences processed", processed.load(AtomicOrdering::Relaxed)),
    );

    let mut report = DedupReport {
        probes: 0,
        duplicates: 0,
        histogram: vec![0; MAX_DUP_INSTANCES],
        self_misses: misses.load(AtomicOrdering::Relaxed),
    };
    for tally in tallies {
        report.probes += tally.probes;
        report.duplicates += tally.duplicates;
        for (total, n) in report.histogram.iter_mut().zip(tally.histogram) {
            *total += n;
        }
    }
    info!(
        "Duplicate identification marked {} of {} sequences, max {} copies, in {:.2}s",
        report.duplicates,
        num_seqs,
        report.max_copies(),
        start.elapsed().as_secs_f64()
    );
    report
}

fn dedup_worker(
    store: &PackedStore,
    index: &SuffixIndex,
    opts: &DedupOptions,
    alloc: &RangeAllocator,
    processed: &AtomicU64,
    misses: &AtomicU64,
) -> WorkerTally {
    let words = store.words();
    let flags = store.flags();
    let paired_mode = opts.paired && !opts.independent_pairs;
    let strands = if opts.strand_specific { 1 } else { 2 };

    let mut tally = WorkerTally { histogram: vec![0; MAX_DUP_INSTANCES], duplicates: 0, probes: 0 };
    let mut batch = FlagBatch::new();
    let mut probe1: Vec<SeqWord> = Vec::new();
    let mut probe2: Vec<SeqWord> = Vec::new();

    while let Some(range) = alloc.claim() {
        let claimed = (range.end() - range.start() + 1) as u64;
        for id in range {
            let pflags = flags.get(id);
            if paired_mode && pflags.contains(SeqFlags::PE2) {
                continue;
            }
            let mate = if paired_mode { mate_of(id, pflags) } else { None };
            if pflags.contains(SeqFlags::NTH_DUP) {
                if let Some(m) = mate {
                    flags.update(m, SeqFlags::NTH_DUP, SeqFlags::NONE);
                }
                continue;
            }
            if let Some(m) = mate {
                if flags.get(m).contains(SeqFlags::NTH_DUP) {
                    flags.update(id, SeqFlags::NTH_DUP, SeqFlags::NONE);
                    continue;
                }
            }
            let (Some(payload), Some(len)) = (store.payload(id), store.seq_len(id)) else {
                continue;
            };
            let mate_seq = mate.and_then(|m| Some((store.payload(m)?, store.seq_len(m)? as usize)));
            if paired_mode && mate_seq.is_none() {
                continue;
            }
            tally.probes += 1;

            let mut copies = 0usize;
            let mut seen_self = false;
            for strand in 0..strands {
                let revcpl = strand == 1;
                // the opposite strand of a pair presents as (rc mate 2, rc mate 1)
                let (len1, len2) = match (revcpl, mate_seq) {
                    (true, Some((mate_payload, mate_len))) => {
                        load_probe(&mut probe1, mate_payload, mate_len, true);
                        load_probe(&mut probe2, payload, len as usize, true);
                        (mate_len, len as usize)
                    }
                    (false, Some((mate_payload, mate_len))) => {
                        load_probe(&mut probe1, payload, len as usize, false);
                        load_probe(&mut probe2, mate_payload, mate_len, false);
                        (len as usize, mate_len)
                    }
                    (_, None) => {
                        load_probe(&mut probe1, payload, len as usize, revcpl);
                        (len as usize, 0)
                    }
                };

                for pos in index.exact_matches(words, &probe1, len1) {
                    let Ok(target) = store.header_of_payload(pos) else {
                        continue;
                    };
                    let tid = target.id;
                    if tid <= id {
                        if tid == id && !revcpl {
                            seen_self = true;
                        }
                        continue;
                    }
                    if target.len as usize != len1 {
                        continue;
                    }
                    let tflags = flags.get(tid);
                    if (paired_mode && tflags.contains(SeqFlags::PE2)) || tflags.contains(SeqFlags::NTH_DUP) {
                        continue;
                    }
                    let target_mate = if paired_mode {
                        let Some(tmate) = mate_of(tid, tflags) else {
                            continue;
                        };
                        let mate_matches = store.seq_len(tmate).is_some_and(|l| l as usize == len2)
                            && store
                                .payload(tmate)
                                .is_some_and(|p| cmp_packed(&probe2, p, len2) == Ordering::Equal);
                        if !mate_matches {
                            continue;
                        }
                        Some(tmate)
                    } else {
                        None
                    };
                    // another worker may have marked it since the check above
                    if !flags.set_if_absent(tid, SeqFlags::NTH_DUP) {
                        continue;
                    }
                    tally.duplicates += 1;
                    copies += 1;
                    if let Some(tmate) = target_mate {
                        if flags.set_if_absent(tmate, SeqFlags::NTH_DUP) {
                            tally.duplicates += 1;
                        }
                    }
                }
            }

            if !seen_self {
                let n = misses.fetch_add(1, AtomicOrdering::Relaxed);
                if n < MAX_MISS_WARNINGS {
                    warn!("Unable to locate sequence {} in the suffix index, skipping", id);
                }
            }
            tally.histogram[copies.min(MAX_DUP_INSTANCES - 1)] += 1;
            let verdict = if copies == 0 { SeqFlags::UNIQUE } else { SeqFlags::FIRST_DUP };
            batch.push(flags, id, verdict, SeqFlags::NONE);
            if let Some(m) = mate {
                batch.push(flags, m, verdict, SeqFlags::NONE);
            }
        }
        batch.flush(flags);
        processed.fetch_add(claimed, AtomicOrdering::Relaxed);
    }
    tally
}

/// Copy `flag` onto the other mate of every pair where either mate carries it.
pub fn propagate_to_mates(store: &PackedStore, flag: SeqFlags) -> u64 {
    let flags = store.flags();
    let mut propagated = 0;
    let mut id = 1;
    while id < store.num_seqs() {
        let (a, b) = (flags.get(id), flags.get(id + 1));
        if a.contains(SeqFlags::PE) && b.contains(SeqFlags::PE2) {
            if a.contains(flag) && !b.contains(flag) {
                flags.update(id + 1, flag, SeqFlags::NONE);
                propagated += 1;
            } else if b.contains(flag) && !a.contains(flag) {
                flags.update(id, flag, SeqFlags::NONE);
                propagated += 1;
            }
            id += 2;
        } else {
            id += 1;
        }
    }
    propagated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexScope;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

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

    fn random_seq(rng: &mut StdRng, len: usize) -> String {
        (0..len).map(|_| ['A', 'C', 'G', 'T'][rng.random_range(0..4)]).collect()
    }

    fn single_end(seqs: &[String]) -> PackedStore {
        let mut store = PackedStore::new();
        for s in seqs {
            store.append(1, SeqFlags::NONE, s.as_bytes()).unwrap();
        }
        store
    }

    fn paired(pairs: &[(String, String)]) -> PackedStore {
        let mut store = PackedStore::new();
        for (r1, r2) in pairs {
            store.append(1, SeqFlags::PE, r1.as_bytes()).unwrap();
            store.append(2, SeqFlags::PE | SeqFlags::PE2, r2.as_bytes()).unwrap();
        }
        store
    }

    fn run(store: &PackedStore, opts: DedupOptions) -> DedupReport {
        let index = SuffixIndex::build(store, IndexScope::first_word()).unwrap();
        identify_duplicates(store, &index, &opts)
    }

    #[test]
    fn test_identical_pair_keeps_lowest_id() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = random_seq(&mut rng, 60);
        let b = random_seq(&mut rng, 60);
        let store = single_end(&[a.clone(), a, b]);
        let report = run(&store, DedupOptions::default());
        let flags = store.flags();
        assert!(flags.get(1).contains(SeqFlags::FIRST_DUP));
        assert!(!flags.get(1).contains(SeqFlags::NTH_DUP));
        assert!(flags.get(2).contains(SeqFlags::NTH_DUP));
        assert!(flags.get(3).contains(SeqFlags::UNIQUE));
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.histogram[0], 1);
        assert_eq!(report.histogram[1], 1);
        assert_eq!(report.max_copies(), 2);
        assert_eq!(report.distribution().collect::<Vec<_>>(), vec![(1, 1), (2, 1)]);
        assert_eq!(report.self_misses, 0);
    }

    #[test]
    fn test_prefix_is_not_duplicate() {
        let mut rng = StdRng::seed_from_u64(2);
        let long = random_seq(&mut rng, 60);
        let short = long[..45].to_string();
        let store = single_end(&[short, long]);
        let report = run(&store, DedupOptions::default());
        assert_eq!(report.duplicates, 0);
        assert_eq!(store.flags().count_with(SeqFlags::UNIQUE), 2);
    }

    #[test]
    fn test_reverse_complement_duplicates_depend_on_strand() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = random_seq(&mut rng, 50);
        let seqs = [a.clone(), revcomp(&a)];

        let store = single_end(&seqs);
        assert_eq!(run(&store, DedupOptions::default()).duplicates, 1);
        assert!(store.flags().get(2).contains(SeqFlags::NTH_DUP));

        let store = single_end(&seqs);
        let opts = DedupOptions { strand_specific: true, ..DedupOptions::default() };
        assert_eq!(run(&store, opts).duplicates, 0);
    }

    #[test]
    fn test_pairs_require_both_mates() {
        let mut rng = StdRng::seed_from_u64(4);
        let (a, b, c) = (random_seq(&mut rng, 40), random_seq(&mut rng, 40), random_seq(&mut rng, 40));
        let store = paired(&[(a.clone(), b.clone()), (a.clone(), b), (a, c)]);
        let opts = DedupOptions { paired: true, strand_specific: true, ..DedupOptions::default() };
        let report = run(&store, opts);
        let flags = store.flags();
        assert_eq!(report.duplicates, 2);
        assert!(flags.get(3).contains(SeqFlags::NTH_DUP));
        assert!(flags.get(4).contains(SeqFlags::NTH_DUP));
        assert!(!flags.get(5).contains(SeqFlags::NTH_DUP));
        assert!(flags.get(2).contains(SeqFlags::FIRST_DUP));
        assert!(flags.get(6).contains(SeqFlags::UNIQUE));
    }

    #[test]
    fn test_pairs_on_opposite_strand() {
        let mut rng = StdRng::seed_from_u64(5);
        let (a, b) = (random_seq(&mut rng, 40), random_seq(&mut rng, 40));
        let store = paired(&[(a.clone(), b.clone()), (revcomp(&b), revcomp(&a))]);
        let opts = DedupOptions { paired: true, ..DedupOptions::default() };
        assert_eq!(run(&store, opts).duplicates, 2);
    }

    #[test]
    fn test_independent_pairs() {
        let mut rng = StdRng::seed_from_u64(6);
        let (a, b, c) = (random_seq(&mut rng, 40), random_seq(&mut rng, 40), random_seq(&mut rng, 40));
        let store = paired(&[(a.clone(), b), (a, c)]);
        let opts = DedupOptions { paired: true, independent_pairs: true, strand_specific: true, threads: 1 };
        assert_eq!(run(&store, opts).duplicates, 1);
        assert!(store.flags().get(3).contains(SeqFlags::NTH_DUP));
        assert!(!store.flags().get(4).contains(SeqFlags::NTH_DUP));

        assert_eq!(propagate_to_mates(&store, SeqFlags::NTH_DUP), 1);
        assert!(store.flags().get(4).contains(SeqFlags::NTH_DUP));
    }

    #[test]
    fn test_second_pass_marks_nothing() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_seq(&mut rng, 33);
        let store = single_end(&[a.clone(), a.clone(), random_seq(&mut rng, 33), a]);
        let index = SuffixIndex::build(&store, IndexScope::first_word()).unwrap();
        let opts = DedupOptions::default();
        assert_eq!(identify_duplicates(&store, &index, &opts).duplicates, 2);
        assert_eq!(identify_duplicates(&store, &index, &opts).duplicates, 0);
    }

    #[test]
    fn test_multithreaded_clusters_keep_lowest_id() {
        let mut rng = StdRng::seed_from_u64(8);
        let templates: Vec<String> = (0..500).map(|_| random_seq(&mut rng, 32)).collect();
        let seqs: Vec<String> = (0..24_000).map(|_| templates[rng.random_range(0..500)].clone()).collect();
        let store = single_end(&seqs);
        let opts = DedupOptions { strand_specific: true, threads: 4, ..DedupOptions::default() };
        let report = run(&store, opts);

        let mut first_seen = std::collections::HashMap::new();
        for (i, s) in seqs.iter().enumerate() {
            first_seen.entry(s.as_str()).or_insert(i as u32 + 1);
        }
        let flags = store.flags();
        for (i, s) in seqs.iter().enumerate() {
            let id = i as u32 + 1;
            let dup = flags.get(id).contains(SeqFlags::NTH_DUP);
            assert_eq!(dup, first_seen[s.as_str()] != id, "id {id}");
        }
        assert_eq!(report.duplicates as usize, seqs.len() - first_seen.len());
    }
}
