//! Sparse suffix index over word-aligned suffixes of the packed arena.
//!
//! Only suffixes starting on a full payload word (every 15th base) are
//! indexed. Entries are word offsets into the arena, sorted by the bases that
//! follow them, so any packed probe can be located by binary search.

use std::cmp::Ordering;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{ArtredError, Result};
use crate::packed::word::{cmp_packed, is_full, words_for, SeqWord, HEADER_WORDS, MAX_CMP_OVERLAP_BASES};
use crate::packed::{first_payload_word, PackedStore, SeqFlags};

/// Above this many entries (or arena words) offsets no longer fit 4 bytes
pub const MAX_SFX_BLK_ELS: u64 = 4_000_000_000;
/// Bases compared when ordering two suffixes
pub const MAX_SORT_SFX_LEN: usize = MAX_CMP_OVERLAP_BASES;

#[derive(Debug)]
enum Entries {
    Narrow(Vec<u32>),
    Wide(Vec<[u8; 5]>),
}

#[inline]
fn pack5(v: u64) -> [u8; 5] {
    let b = v.to_le_bytes();
    [b[0], b[1], b[2], b[3], b[4]]
}

#[inline]
fn unpack5(e: &[u8; 5]) -> usize {
    u64::from_le_bytes([e[0], e[1], e[2], e[3], e[4], 0, 0, 0]) as usize
}

impl Entries {
    fn len(&self) -> usize {
        match self {
            Entries::Narrow(v) => v.len(),
            Entries::Wide(v) => v.len(),
        }
    }

    #[inline]
    fn get(&self, i: usize) -> usize {
        match self {
            Entries::Narrow(v) => v[i] as usize,
            Entries::Wide(v) => unpack5(&v[i]),
        }
    }
}

/// Which word boundaries of each sequence get an index entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexScope {
    /// Index at most this many leading words per sequence (0 = all)
    pub first_n_words: usize,
    /// Leave this many trailing words unindexed (ignored when `first_n_words == 1`)
    pub exclude_last_n_words: usize,
    /// Skip sequences flagged as either mate of a pair
    pub exclude_paired: bool,
}

impl IndexScope {
    /// One entry per sequence, at its first word.
    pub fn first_word() -> Self {
        Self { first_n_words: 1, ..Self::default() }
    }
}

#[derive(Debug)]
pub struct SuffixIndex {
    entries: Entries,
    generation: u64,
}

impl SuffixIndex {
    /// Walk the arena once collecting entries, then sort them in parallel.
    pub fn build(store: &PackedStore, scope: IndexScope) -> Result<Self> {
        let start = Instant::now();
        let words = store.words();
        let exclude_last = if scope.first_n_words == 1 { 0 } else { scope.exclude_last_n_words };

        let mut count: u64 = 0;
        for_each_entry(store, scope.first_n_words, exclude_last, scope.exclude_paired, |_| count += 1);

        let wide = count > MAX_SFX_BLK_ELS || words.len() as u64 > MAX_SFX_BLK_ELS;
        let elem_size: u64 = if wide { 5 } else { 4 };
        let oom = |_| ArtredError::OutOfMemory { what: "suffix index", requested: count * elem_size };

        let entries = if wide {
            let mut v: Vec<[u8; 5]> = Vec::new();
            v.try_reserve_exact(count as usize).map_err(oom)?;
            for_each_entry(store, scope.first_n_words, exclude_last, scope.exclude_paired, |pos| {
                v.push(pack5(pos as u64))
            });
            v.par_sort_unstable_by(|a, b| cmp_suffixes(words, unpack5(a), unpack5(b)));
            Entries::Wide(v)
        } else {
            let mut v: Vec<u32> = Vec::new();
            v.try_reserve_exact(count as usize).map_err(oom)?;
            for_each_entry(store, scope.first_n_words, exclude_last, scope.exclude_paired, |pos| {
                v.push(pos as u32)
            });
            v.par_sort_unstable_by(|&a, &b| cmp_suffixes(words, a as usize, b as usize));
            Entries::Narrow(v)
        };

        debug!("Suffix index uses {elem_size} byte entries");
        info!(
            "Suffix index of {} entries built in {:.2}s",
            entries.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(Self { entries, generation: store.generation() })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Bytes per entry, 4 or 5.
    pub fn entry_size(&self) -> usize {
        match self.entries {
            Entries::Narrow(_) => 4,
            Entries::Wide(_) => 5,
        }
    }

    /// Index was built against the current contents of `store`.
    pub fn is_current(&self, store: &PackedStore) -> bool {
        self.generation == store.generation()
    }

    /// Arena word offset of sorted entry `i`.
    pub fn entry(&self, i: usize) -> Option<usize> {
        (i < self.entries.len()).then(|| self.entries.get(i))
    }

    fn cmp_entry(&self, words: &[SeqWord], i: usize, probe: &[SeqWord], probe_len: usize) -> Ordering {
        cmp_packed(&words[self.entries.get(i)..], probe, probe_len)
    }

    /// Lowest sorted position whose suffix matches `probe` over `probe_len` bases.
    pub fn locate_first_exact(&self, words: &[SeqWord], probe: &[SeqWord], probe_len: usize) -> Option<usize> {
        let (mut lo, mut hi) = (0, self.entries.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.cmp_entry(words, mid, probe, probe_len) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo < self.entries.len() && self.cmp_entry(words, lo, probe, probe_len) == Ordering::Equal)
            .then_some(lo)
    }

    /// Highest sorted position whose suffix matches `probe` over `probe_len` bases.
    pub fn locate_last_exact(&self, words: &[SeqWord], probe: &[SeqWord], probe_len: usize) -> Option<usize> {
        let (mut lo, mut hi) = (0, self.entries.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.cmp_entry(words, mid, probe, probe_len) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let last = lo.checked_sub(1)?;
        (self.cmp_entry(words, last, probe, probe_len) == Ordering::Equal).then_some(last)
    }

    /// Arena offsets of every entry matching `probe`, in sorted order.
    pub fn exact_matches<'a>(
        &'a self,
        words: &'a [SeqWord],
        probe: &'a [SeqWord],
        probe_len: usize,
    ) -> impl Iterator<Item = usize> + 'a {
        self.locate_first_exact(words, probe, probe_len)
            .into_iter()
            .flat_map(move |first| first..self.entries.len())
            .take_while(move |&i| self.cmp_entry(words, i, probe, probe_len) == Ordering::Equal)
            .map(move |i| self.entries.get(i))
    }

    /// First payload word of the sequence holding sorted entry `i`.
    pub fn first_word_of(&self, words: &[SeqWord], i: usize) -> Option<usize> {
        first_payload_word(words, self.entry(i)?)
    }
}

#[inline]
fn cmp_suffixes(words: &[SeqWord], a: usize, b: usize) -> Ordering {
    cmp_packed(&words[a..], &words[b..], MAX_SORT_SFX_LEN)
}

/// Visit the arena offset of every indexable word in sequence order.
fn for_each_entry<F: FnMut(usize)>(
    store: &PackedStore,
    first_n_words: usize,
    exclude_last_n_words: usize,
    exclude_paired: bool,
    mut visit: F,
) {
    let words = store.words();
    for id in 1..=store.num_seqs() {
        let (Some(start), Some(header)) = (store.start_of(id), store.header(id)) else {
            continue;
        };
        if exclude_paired && header.flags.intersects(SeqFlags::PAIRING) {
            continue;
        }
        let seq_words = words_for(header.len as usize);
        let mut limit = if first_n_words > 0 { first_n_words.min(seq_words) } else { seq_words };
        if exclude_last_n_words > 0 {
            limit = limit.min(seq_words.saturating_sub(exclude_last_n_words).max(1));
        }
        let first = start + HEADER_WORDS;
        for pos in first..first + limit {
            // partial words are never indexed
            if is_full(words[pos]) {
                visit(pos);
            }
        }
    }
}
