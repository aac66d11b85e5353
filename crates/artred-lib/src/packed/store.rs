//! The packed sequence arena and its per-sequence side arrays.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use super::flags::{FlagTable, SeqFlags};
use super::word::{
    base_code, pack_codes, reverse_complement_in_place, reverse_in_place, complement_in_place,
    trim_in_place, words_for, Bases, SeqWord, SequenceHeader, BOS, EOS, HEADER_WORDS,
    MAX_RAW_SEQ_LEN,
};
use crate::error::{ArtredError, Result};

/// Words reserved beyond the minimum whenever the arena grows
const ARENA_GROWTH_SLACK: usize = 1000;
/// Seed for indeterminate-base substitution unless the caller supplies one
const DEFAULT_N_SEED: u64 = 0x5EED_A7ED;

/// Length statistics over the sequences currently held.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StoreStats {
    pub num_seqs: u32,
    pub total_len: u64,
    pub min_len: u32,
    pub max_len: u32,
    pub mean_len: f64,
}

impl StoreStats {
    fn record(&mut self, len: u32) {
        self.num_seqs += 1;
        self.total_len += len as u64;
        if self.min_len == 0 || len < self.min_len {
            self.min_len = len;
        }
        self.max_len = self.max_len.max(len);
        self.mean_len = self.total_len as f64 / self.num_seqs as f64;
    }
}

/// What [`PackedStore::compact`] does with one sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retain {
    Keep,
    Drop,
    /// Keep after trimming both ends, replacing the header flags
    Trim { trim5: u32, trim3: u32, flags: SeqFlags },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactStats {
    pub removed: u32,
    pub remaining: u32,
}

/// Owns every accepted sequence, packed 15 bases per word behind a 3-word
/// header, between a leading [`BOS`] and trailing [`EOS`] sentinel.
///
/// Alongside the arena it keeps the two sequence index arrays: the word offset
/// of each sequence header and the lock-free flag word of each sequence, both
/// indexed by `id - 1`. Appends keep them current; [`PackedStore::gen_seq_starts`]
/// rebuilds them from the arena after a load or compaction.
#[derive(Debug)]
pub struct PackedStore {
    words: Vec<SeqWord>,
    seq_starts: Vec<u64>,
    flags: FlagTable,
    stats: StoreStats,
    generation: u64,
    rng: StdRng,
    codes: Vec<u8>,
}

impl Default for PackedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PackedStore {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_N_SEED)
    }

    /// Empty store substituting indeterminate bases from a generator seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            words: Vec::new(),
            seq_starts: Vec::new(),
            flags: FlagTable::default(),
            stats: StoreStats::default(),
            generation: 0,
            rng: StdRng::seed_from_u64(seed),
            codes: Vec::new(),
        }
    }

    /// Rebuild a store from raw arena words, validating every header.
    pub fn from_words(words: Vec<SeqWord>) -> Result<Self> {
        if words.first() != Some(&BOS) {
            return Err(ArtredError::NotAHeader { word_index: 0 });
        }
        if words.last() != Some(&EOS) {
            return Err(ArtredError::NotAHeader { word_index: words.len().saturating_sub(1) });
        }
        let mut store = Self::new();
        store.words = words;
        store.gen_seq_starts()?;
        Ok(store)
    }

    /// Make room for at least `words` arena words in total.
    pub fn reserve_words(&mut self, words: usize) -> Result<()> {
        if words <= self.words.capacity() {
            return Ok(());
        }
        self.words.try_reserve_exact(words - self.words.len()).map_err(|_| {
            ArtredError::OutOfMemory {
                what: "packed sequence arena",
                requested: (words * std::mem::size_of::<SeqWord>()) as u64,
            }
        })?;
        debug!("Packed arena capacity now {} words", self.words.capacity());
        Ok(())
    }

    /// Pack `bases` behind a new header and return the sequence id.
    ///
    /// Bases outside ACGT are replaced with a pseudo-random canonical base.
    pub fn append(&mut self, source_file_id: u8, flags: SeqFlags, bases: &[u8]) -> Result<u32> {
        let len = bases.len();
        if len == 0 || len > MAX_RAW_SEQ_LEN {
            return Err(ArtredError::InvalidLength { len, max: MAX_RAW_SEQ_LEN });
        }
        if source_file_id == 0 {
            return Err(ArtredError::invalid("source_file_id", "must be in range 1..=255"));
        }
        let id = self.stats.num_seqs.checked_add(1).ok_or_else(|| {
            ArtredError::invalid("sequence id", "identifier space exhausted")
        })?;

        let needed = self.words.len().max(1) + HEADER_WORDS + words_for(len) + 1;
        if needed > self.words.capacity() {
            self.reserve_words((needed + ARENA_GROWTH_SLACK) * 120 / 100)?;
        }
        self.seq_starts.try_reserve(1).map_err(|_| ArtredError::OutOfMemory {
            what: "sequence start offsets",
            requested: ((self.seq_starts.len() + 1) * 8) as u64,
        })?;
        self.flags.try_reserve(1).map_err(|_| ArtredError::OutOfMemory {
            what: "sequence flags",
            requested: ((self.flags.len() + 1) * 2) as u64,
        })?;

        if self.words.is_empty() {
            self.words.push(BOS);
        } else {
            self.words.pop();
        }
        let start = self.words.len();
        let header = SequenceHeader { id, source_file_id, flags, len: len as u32 };
        self.words.extend_from_slice(&header.encode());

        self.codes.clear();
        for &b in bases {
            let code = match base_code(b) {
                Some(code) => code,
                None => self.rng.random_range(0..4u8),
            };
            self.codes.push(code);
        }
        pack_codes(&self.codes, &mut self.words);
        self.words.push(EOS);

        self.seq_starts.push(start as u64);
        self.flags.push(flags);
        self.stats.record(len as u32);
        self.generation += 1;
        Ok(id)
    }

    pub fn num_seqs(&self) -> u32 {
        self.stats.num_seqs
    }

    pub fn is_empty(&self) -> bool {
        self.stats.num_seqs == 0
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Raw arena words, sentinels included.
    pub fn words(&self) -> &[SeqWord] {
        &self.words
    }

    /// Bumped by every mutation that moves or rewrites payload words.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn flags(&self) -> &FlagTable {
        &self.flags
    }

    /// Word offset of the header of `id`.
    #[inline]
    pub fn start_of(&self, id: u32) -> Option<usize> {
        (id as usize)
            .checked_sub(1)
            .and_then(|i| self.seq_starts.get(i))
            .map(|&s| s as usize)
    }

    pub fn header(&self, id: u32) -> Option<SequenceHeader> {
        self.start_of(id).and_then(|s| SequenceHeader::decode(&self.words[s..]))
    }

    /// Parse the header whose first word is at `word_index`.
    pub fn header_at(&self, word_index: usize) -> Result<SequenceHeader> {
        self.words
            .get(word_index..)
            .and_then(SequenceHeader::decode)
            .ok_or(ArtredError::NotAHeader { word_index })
    }

    /// Header of the sequence owning the payload word at `word_index`.
    pub fn header_of_payload(&self, word_index: usize) -> Result<SequenceHeader> {
        let first = super::first_payload_word(&self.words, word_index)
            .ok_or(ArtredError::NotAHeader { word_index })?;
        self.header_at(first - HEADER_WORDS)
    }

    pub fn seq_len(&self, id: u32) -> Option<u32> {
        self.header(id).map(|h| h.len)
    }

    /// Payload words of `id`, excluding the header and the following terminal word.
    pub fn payload(&self, id: u32) -> Option<&[SeqWord]> {
        let start = self.start_of(id)?;
        let header = SequenceHeader::decode(&self.words[start..])?;
        let first = start + HEADER_WORDS;
        self.words.get(first..first + words_for(header.len as usize))
    }

    /// Lazily decoded ASCII bases of `id`, at most `max_bases` of them.
    pub fn decode(&self, id: u32, max_bases: usize) -> Option<Bases<'_>> {
        let payload = self.payload(id)?;
        Some(Bases::new(payload, max_bases))
    }

    /// Decoded bases of `id` collected into a buffer.
    pub fn sequence(&self, id: u32) -> Option<Vec<u8>> {
        self.decode(id, usize::MAX).map(Iterator::collect)
    }

    /// Merge `set`/`reset` into the header flags of `id`.
    pub fn update_header_flags(&mut self, id: u32, set: SeqFlags, reset: SeqFlags) -> Option<SeqFlags> {
        let start = self.start_of(id)?;
        let mut header = SequenceHeader::decode(&self.words[start..])?;
        header.flags = header.flags.merge(set, reset);
        self.words[start..start + HEADER_WORDS].copy_from_slice(&header.encode());
        Some(header.flags)
    }

    /// Copy the side-array flags of every sequence into its header.
    pub fn sync_header_flags(&mut self) {
        for i in 0..self.seq_starts.len() {
            let start = self.seq_starts[i] as usize;
            let flags = self.flags.get(i as u32 + 1);
            if let Some(mut header) = SequenceHeader::decode(&self.words[start..]) {
                header.flags = flags;
                self.words[start..start + HEADER_WORDS].copy_from_slice(&header.encode());
            }
        }
    }

    /// Clear every flag outside `keep`, in both headers and the side array.
    pub fn reset_flags(&mut self, keep: SeqFlags) {
        self.flags.update_all(SeqFlags::NONE, !keep);
        for i in 0..self.seq_starts.len() {
            let start = self.seq_starts[i] as usize;
            if let Some(mut header) = SequenceHeader::decode(&self.words[start..]) {
                header.flags = header.flags & keep;
                self.words[start..start + HEADER_WORDS].copy_from_slice(&header.encode());
            }
        }
    }

    fn payload_mut(&mut self, id: u32) -> Result<(&mut [SeqWord], usize)> {
        let header = self
            .header(id)
            .ok_or_else(|| ArtredError::invalid("id", format!("no sequence with id {id}")))?;
        let first = self.start_of(id).unwrap_or_default() + HEADER_WORDS;
        let len = header.len as usize;
        Ok((&mut self.words[first..first + words_for(len)], len))
    }

    pub fn reverse_complement(&mut self, id: u32) -> Result<()> {
        let (payload, len) = self.payload_mut(id)?;
        reverse_complement_in_place(payload, len);
        self.generation += 1;
        Ok(())
    }

    pub fn reverse(&mut self, id: u32) -> Result<()> {
        let (payload, len) = self.payload_mut(id)?;
        reverse_in_place(payload, len);
        self.generation += 1;
        Ok(())
    }

    pub fn complement(&mut self, id: u32) -> Result<()> {
        let (payload, len) = self.payload_mut(id)?;
        complement_in_place(payload, len);
        self.generation += 1;
        Ok(())
    }

    /// Reverse complement every sequence in place, in parallel.
    pub fn reverse_complement_all(&mut self) {
        if self.words.len() < 2 {
            return;
        }
        let mut views: Vec<(usize, &mut [SeqWord])> = Vec::with_capacity(self.seq_starts.len());
        let mut rest: &mut [SeqWord] = &mut self.words[1..];
        for _ in 0..self.stats.num_seqs {
            let Some(header) = SequenceHeader::decode(rest) else {
                break;
            };
            let len = header.len as usize;
            let span = HEADER_WORDS + words_for(len);
            let (seq, tail) = std::mem::take(&mut rest).split_at_mut(span);
            views.push((len, &mut seq[HEADER_WORDS..]));
            rest = tail;
        }
        views
            .into_par_iter()
            .for_each(|(len, payload)| reverse_complement_in_place(payload, len));
        self.generation += 1;
    }

    /// Rebuild header offsets, flags and length statistics by walking the arena.
    pub fn gen_seq_starts(&mut self) -> Result<()> {
        self.seq_starts.clear();
        self.flags.clear();
        self.stats = StoreStats::default();
        if self.words.is_empty() {
            return Ok(());
        }
        let mut pos = 1;
        loop {
            let w = *self.words.get(pos).ok_or(ArtredError::NotAHeader { word_index: pos })?;
            if w == EOS {
                break;
            }
            let header = SequenceHeader::decode(&self.words[pos..])
                .filter(|h| h.id as usize == self.seq_starts.len() + 1 && h.len > 0)
                .ok_or(ArtredError::NotAHeader { word_index: pos })?;
            self.seq_starts.push(pos as u64);
            self.flags.push(header.flags);
            self.stats.record(header.len);
            pos += HEADER_WORDS + words_for(header.len as usize);
        }
        self.generation += 1;
        Ok(())
    }

    /// Single forward pass dropping, keeping or trimming each sequence, then
    /// renumbering survivors contiguously from 1.
    ///
    /// Flags are taken from the headers, so callers that mutated the side
    /// array must [`sync_header_flags`](Self::sync_header_flags) first.
    pub fn compact<F>(&mut self, mut decide: F) -> Result<CompactStats>
    where
        F: FnMut(&SequenceHeader) -> Retain,
    {
        let before = self.stats.num_seqs;
        if self.words.is_empty() {
            return Ok(CompactStats::default());
        }
        let mut read = 1;
        let mut write = 1;
        let mut new_id = 0u32;
        while read < self.words.len() && self.words[read] != EOS {
            let header = SequenceHeader::decode(&self.words[read..])
                .ok_or(ArtredError::NotAHeader { word_index: read })?;
            let len = header.len as usize;
            let span = HEADER_WORDS + words_for(len);
            match decide(&header) {
                Retain::Drop => {}
                Retain::Keep => {
                    new_id += 1;
                    self.words.copy_within(read..read + span, write);
                    let renumbered = SequenceHeader { id: new_id, ..header };
                    self.words[write..write + HEADER_WORDS].copy_from_slice(&renumbered.encode());
                    write += span;
                }
                Retain::Trim { trim5, trim3, flags } => {
                    let payload = &mut self.words[read + HEADER_WORDS..read + span];
                    let new_len = trim_in_place(payload, len, trim5 as usize, trim3 as usize);
                    if new_len > 0 {
                        new_id += 1;
                        let new_words = words_for(new_len);
                        let from = read + HEADER_WORDS;
                        self.words.copy_within(from..from + new_words, write + HEADER_WORDS);
                        let trimmed = SequenceHeader { id: new_id, flags, len: new_len as u32, ..header };
                        self.words[write..write + HEADER_WORDS].copy_from_slice(&trimmed.encode());
                        write += HEADER_WORDS + new_words;
                    }
                }
            }
            read += span;
        }
        self.words.truncate(write);
        self.words.push(EOS);
        self.gen_seq_starts()?;
        Ok(CompactStats { removed: before - self.stats.num_seqs, remaining: self.stats.num_seqs })
    }
}

/// Id of the other mate of a paired sequence.
pub fn mate_of(id: u32, flags: SeqFlags) -> Option<u32> {
    if !flags.contains(SeqFlags::PE) {
        return None;
    }
    if flags.contains(SeqFlags::PE2) {
        id.checked_sub(1)
    } else {
        id.checked_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packed::word::MAX_RAW_SEQ_LEN;

    fn seq_string(store: &PackedStore, id: u32) -> String {
        String::from_utf8(store.sequence(id).unwrap()).unwrap()
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

    #[test]
    fn test_append_assigns_dense_ids() {
        let mut store = PackedStore::new();
        let a = store.append(1, SeqFlags::NONE, b"ACGTACGTACGTACGTACGTA").unwrap();
        let b = store.append(2, SeqFlags::PE, b"TTTTGGGGCCCCAAAA").unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(seq_string(&store, 1), "ACGTACGTACGTACGTACGTA");
        assert_eq!(seq_string(&store, 2), "TTTTGGGGCCCCAAAA");
        let h = store.header(2).unwrap();
        assert_eq!((h.id, h.source_file_id, h.flags, h.len), (2, 2, SeqFlags::PE, 16));
        assert_eq!(store.words().first(), Some(&BOS));
        assert_eq!(store.words().last(), Some(&EOS));
        let stats = store.stats();
        assert_eq!((stats.num_seqs, stats.total_len, stats.min_len, stats.max_len), (2, 37, 16, 21));
    }

    #[test]
    fn test_append_rejects_bad_lengths() {
        let mut store = PackedStore::new();
        assert!(matches!(
            store.append(1, SeqFlags::NONE, b""),
            Err(ArtredError::InvalidLength { len: 0, .. })
        ));
        let too_long = vec![b'A'; MAX_RAW_SEQ_LEN + 1];
        assert!(matches!(
            store.append(1, SeqFlags::NONE, &too_long),
            Err(ArtredError::InvalidLength { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_indeterminate_bases_substituted() {
        let mut store = PackedStore::with_seed(7);
        store.append(1, SeqFlags::NONE, b"ACGTNNNNNNACGT").unwrap();
        let decoded = store.sequence(1).unwrap();
        assert_eq!(decoded.len(), 14);
        assert_eq!(&decoded[..4], b"ACGT");
        assert!(decoded.iter().all(|b| b"ACGT".contains(b)));
    }

    #[test]
    fn test_decode_is_restartable() {
        let mut store = PackedStore::new();
        store.append(1, SeqFlags::NONE, b"GATTACAGATTACAGATTACA").unwrap();
        let bases = store.decode(1, 10).unwrap();
        let first: Vec<u8> = bases.clone().collect();
        let second: Vec<u8> = bases.collect();
        assert_eq!(first, b"GATTACAGAT");
        assert_eq!(first, second);
    }

    #[test]
    fn test_header_at_rejects_non_headers() {
        let mut store = PackedStore::new();
        store.append(1, SeqFlags::NONE, b"ACGTACGTACGTACGTACGT").unwrap();
        assert!(store.header_at(1).is_ok());
        assert!(matches!(store.header_at(0), Err(ArtredError::NotAHeader { word_index: 0 })));
        assert!(matches!(store.header_at(4), Err(ArtredError::NotAHeader { .. })));
        let last = store.words().len() - 1;
        assert!(store.header_at(last).is_err());
        assert_eq!(store.header_of_payload(5).unwrap().id, 1);
    }

    #[test]
    fn test_arena_grows_preserving_content() {
        let mut store = PackedStore::new();
        let read = b"ACGTTGCAACGTAGGCTTAACCGGTATAGCATGCAAATTTCCCGGGATTAC";
        for _ in 0..500 {
            store.append(1, SeqFlags::NONE, read).unwrap();
        }
        assert_eq!(store.num_seqs(), 500);
        for id in [1, 250, 500] {
            assert_eq!(store.sequence(id).unwrap(), read.to_vec());
        }
    }

    #[test]
    fn test_update_header_flags_and_sync() {
        let mut store = PackedStore::new();
        store.append(1, SeqFlags::PE, b"ACGTACGTACGTACGTACGT").unwrap();
        let merged = store.update_header_flags(1, SeqFlags::REMOVE, SeqFlags::PE).unwrap();
        assert_eq!(merged, SeqFlags::REMOVE);
        store.flags().update(1, SeqFlags::FIVE_PRIME, SeqFlags::NONE);
        store.sync_header_flags();
        assert_eq!(store.header(1).unwrap().flags, SeqFlags::PE | SeqFlags::FIVE_PRIME);
        store.reset_flags(SeqFlags::PAIRING);
        assert_eq!(store.header(1).unwrap().flags, SeqFlags::PE);
        assert_eq!(store.flags().get(1), SeqFlags::PE);
    }

    #[test]
    fn test_reverse_complement_single_and_all() {
        let mut store = PackedStore::new();
        let a = "ACGTTGCAACGTAGGCTTAACCGGTATAG";
        let b = "TTTTGGGGCCCCAAAAT";
        store.append(1, SeqFlags::NONE, a.as_bytes()).unwrap();
        store.append(1, SeqFlags::NONE, b.as_bytes()).unwrap();

        store.reverse_complement(2).unwrap();
        assert_eq!(seq_string(&store, 2), revcomp(b));
        assert_eq!(seq_string(&store, 1), a);

        store.reverse_complement_all();
        assert_eq!(seq_string(&store, 1), revcomp(a));
        assert_eq!(seq_string(&store, 2), b);
        assert!(store.reverse_complement(3).is_err());
    }

    #[test]
    fn test_compact_renumbers_and_trims() {
        let mut store = PackedStore::new();
        store.append(1, SeqFlags::NONE, b"AAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        store.append(1, SeqFlags::REMOVE, b"CCCCCCCCCCCCCCCCCCCC").unwrap();
        store.append(1, SeqFlags::FIVE_PRIME, b"GGGGGGGGGGTTTTTTTTTT").unwrap();
        let stats = store
            .compact(|h| {
                if h.flags.contains(SeqFlags::REMOVE) {
                    Retain::Drop
                } else if h.flags.contains(SeqFlags::FIVE_PRIME) {
                    Retain::Trim { trim5: 0, trim3: 10, flags: SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME }
                } else {
                    Retain::Keep
                }
            })
            .unwrap();
        assert_eq!(stats, CompactStats { removed: 1, remaining: 2 });
        assert_eq!(store.num_seqs(), 2);
        assert_eq!(seq_string(&store, 1), "A".repeat(24));
        assert_eq!(seq_string(&store, 2), "G".repeat(10));
        let h = store.header(2).unwrap();
        assert_eq!(h.id, 2);
        assert_eq!(h.flags, SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME);
        assert_eq!(store.stats().total_len, 34);
        assert_eq!(store.words().last(), Some(&EOS));
    }

    #[test]
    fn test_from_words_validates() {
        let mut store = PackedStore::new();
        store.append(3, SeqFlags::PE, b"ACGTACGTACGTACGTACGTACGT").unwrap();
        let words = store.words().to_vec();
        let restored = PackedStore::from_words(words.clone()).unwrap();
        assert_eq!(restored.stats(), store.stats());
        assert_eq!(restored.flags().get(1), SeqFlags::PE);

        let mut broken = words;
        broken[2] = 0x1234;
        assert!(PackedStore::from_words(broken).is_err());
        assert!(PackedStore::from_words(vec![EOS]).is_err());
    }

    #[test]
    fn test_mate_of() {
        assert_eq!(mate_of(5, SeqFlags::PE), Some(6));
        assert_eq!(mate_of(6, SeqFlags::PE | SeqFlags::PE2), Some(5));
        assert_eq!(mate_of(5, SeqFlags::NONE), None);
    }
}
