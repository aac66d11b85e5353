//! Packed sequence representation: word codec, flags and the owning arena.

pub mod flags;
pub mod store;
pub mod word;

pub use flags::{FlagBatch, FlagTable, SeqFlags};
pub use store::{mate_of, CompactStats, PackedStore, Retain, StoreStats};
pub use word::{SeqWord, SequenceHeader};

/// First payload word of the sequence containing payload word `word_index`.
///
/// Walks back while the preceding word is payload; `None` if `word_index`
/// itself is a header or sentinel.
pub fn first_payload_word(words: &[SeqWord], word_index: usize) -> Option<usize> {
    let w = *words.get(word_index)?;
    if word::is_terminal(w) {
        return None;
    }
    let mut idx = word_index;
    while idx > 0 && !word::is_terminal(words[idx - 1]) {
        idx -= 1;
    }
    (idx >= word::HEADER_WORDS).then_some(idx)
}
