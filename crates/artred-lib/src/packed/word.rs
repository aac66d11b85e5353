//! 32-bit packed sequence words.
//!
//! A payload word carries 15 two-bit bases (A=0, C=1, G=2, T=3) with the first
//! base in bits 29..28 and bits 31..30 clear. The last word of a sequence may
//! hold fewer bases: it sets bit 30, follows its bases with a `00` terminator
//! pair and fills the remaining low pairs with `11`.
//!
//! Words with bit 31 set are never payload. They are either one of the three
//! header words preceding each sequence or the arena sentinels [`BOS`]/[`EOS`],
//! and every comparison treats them as the end of a sequence.

use std::cmp::Ordering;

use super::flags::SeqFlags;

pub type SeqWord = u32;

/// Bases packed into one full payload word
pub const BASES_PER_WORD: usize = 15;
/// Header words preceding each sequence payload
pub const HEADER_WORDS: usize = 3;

/// Marks the logical start of the arena
pub const BOS: SeqWord = 0xA000_0000;
/// Marks the logical end of the arena
pub const EOS: SeqWord = 0xA000_0001;
/// Tag of the first header word
pub const MSW_HDR: SeqWord = 0x8000_0000;
/// Bits compared against [`MSW_HDR`] to recognise a first header word
pub const MSW_MASK: SeqWord = 0xE000_0000;
/// Tag of the second and third header words
pub const LSW_HDR: SeqWord = 0xC000_0000;
/// Set on a final payload word holding fewer than 15 bases
pub const PARTIAL: SeqWord = 0x4000_0000;
pub const PAYLOAD_MASK: SeqWord = 0x3FFF_FFFF;

const TERMINAL_BIT: SeqWord = 0x8000_0000;
const KIND_MASK: SeqWord = 0xC000_0000;

/// Longest raw read accepted for packing
pub const MAX_RAW_SEQ_LEN: usize = 0x03FF_FFFF;
/// Cap on packed words compared in one overlap or sort comparison
pub const MAX_OVERLAP_SEQ_WORDS: usize = 1024 * 1024;
/// Cap on bases compared in one overlap or sort comparison
pub const MAX_CMP_OVERLAP_BASES: usize = MAX_OVERLAP_SEQ_WORDS * BASES_PER_WORD;

const BASE_CHARS: [u8; 4] = *b"ACGT";

#[inline]
pub fn is_header_start(w: SeqWord) -> bool {
    w & MSW_MASK == MSW_HDR
}

/// Header or sentinel: ends a sequence for every reader.
#[inline]
pub fn is_terminal(w: SeqWord) -> bool {
    w & TERMINAL_BIT != 0
}

#[inline]
pub fn is_partial(w: SeqWord) -> bool {
    w & KIND_MASK == PARTIAL
}

#[inline]
pub fn is_full(w: SeqWord) -> bool {
    w & KIND_MASK == 0
}

/// Payload words needed for `len` bases.
#[inline]
pub fn words_for(len: usize) -> usize {
    len.div_ceil(BASES_PER_WORD)
}

/// Map an ASCII base to its 2-bit code; anything outside ACGT is indeterminate.
#[inline]
pub fn base_code(b: u8) -> Option<u8> {
    match b {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

#[inline]
pub fn code_base(code: u8) -> u8 {
    BASE_CHARS[(code & 0x03) as usize]
}

/// Two-bit code of base `k` (0 = first) within a payload word.
#[inline]
pub fn base_in_word(w: SeqWord, k: usize) -> u8 {
    ((w >> (28 - 2 * k)) & 0x03) as u8
}

/// Number of bases held in a partial word.
///
/// Filler pairs are `11`, so the first `00` pair found scanning up from the
/// low bits is the terminator.
pub fn partial_len(w: SeqWord) -> usize {
    (0..BASES_PER_WORD)
        .find(|&pair| (w >> (2 * pair)) & 0x03 == 0)
        .map_or(0, |pair| BASES_PER_WORD - 1 - pair)
}

/// Bases held in any payload word.
#[inline]
pub fn word_bases(w: SeqWord) -> usize {
    if is_partial(w) {
        partial_len(w)
    } else {
        BASES_PER_WORD
    }
}

/// Terminator, filler and marker bits for a partial word of `n` (< 15) bases.
#[inline]
fn partial_tail(n: usize) -> SeqWord {
    let filler_pairs = BASES_PER_WORD - 1 - n;
    ((1u32 << (2 * filler_pairs)) - 1) | PARTIAL
}

fn pack_chunk(chunk: &[u8]) -> SeqWord {
    let mut w = 0;
    for (k, &code) in chunk.iter().enumerate() {
        w |= ((code & 0x03) as SeqWord) << (28 - 2 * k);
    }
    if chunk.len() < BASES_PER_WORD {
        w | partial_tail(chunk.len())
    } else {
        w
    }
}

/// Pack 2-bit codes onto the end of `out`.
pub fn pack_codes(codes: &[u8], out: &mut Vec<SeqWord>) {
    out.extend(codes.chunks(BASES_PER_WORD).map(pack_chunk));
}

/// Lazily unpacked ASCII bases of a packed run.
///
/// Stops at the first header/sentinel word, after the bases of a partial word,
/// or once `remaining` bases have been produced. Cloning restarts nothing but
/// yields an independent cursor at the same position.
#[derive(Clone, Debug)]
pub struct Bases<'a> {
    words: &'a [SeqWord],
    word: usize,
    pos: usize,
    remaining: usize,
}

impl<'a> Bases<'a> {
    pub fn new(words: &'a [SeqWord], max_bases: usize) -> Self {
        Self { words, word: 0, pos: 0, remaining: max_bases }
    }
}

impl Iterator for Bases<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        loop {
            if self.remaining == 0 {
                return None;
            }
            let w = *self.words.get(self.word)?;
            if is_terminal(w) {
                return None;
            }
            let n = word_bases(w);
            if self.pos >= n {
                if n < BASES_PER_WORD {
                    return None;
                }
                self.word += 1;
                self.pos = 0;
                continue;
            }
            let code = base_in_word(w, self.pos);
            self.pos += 1;
            self.remaining -= 1;
            return Some(code_base(code));
        }
    }
}

/// Lexicographic comparison of two packed runs over at most `max_len` bases.
///
/// A header or sentinel word (or the end of the slice) ends a run; a run that
/// ends first orders first. Runs agreeing over `max_len` bases are equal, which
/// keeps prefix-limited binary search over a fully sorted index monotone.
pub fn cmp_packed(probe: &[SeqWord], target: &[SeqWord], max_len: usize) -> Ordering {
    let mut remaining = max_len;
    let mut i = 0;
    loop {
        if remaining == 0 {
            return Ordering::Equal;
        }
        let p = probe.get(i).copied().unwrap_or(EOS);
        let t = target.get(i).copied().unwrap_or(EOS);
        match (is_terminal(p), is_terminal(t)) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        if is_full(p) && is_full(t) && remaining >= BASES_PER_WORD {
            if p != t {
                return p.cmp(&t);
            }
            remaining -= BASES_PER_WORD;
            i += 1;
            continue;
        }

        let p_len = word_bases(p);
        let t_len = word_bases(t);
        let n = p_len.min(t_len).min(remaining);
        for k in 0..n {
            match base_in_word(p, k).cmp(&base_in_word(t, k)) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        if n == remaining {
            return Ordering::Equal;
        }
        if p_len != t_len {
            return p_len.cmp(&t_len);
        }
        if p_len < BASES_PER_WORD {
            // both runs end in equal partial words
            return Ordering::Equal;
        }
        remaining -= n;
        i += 1;
    }
}

#[inline]
fn payload_or_zero(w: Option<SeqWord>) -> SeqWord {
    match w {
        Some(w) if !is_terminal(w) => w & PAYLOAD_MASK,
        _ => 0,
    }
}

/// Word `j` of `src` shifted left by `shift` bases, topped up from word `j + 1`.
#[inline]
fn shifted_word(src: &[SeqWord], j: usize, shift: usize) -> SeqWord {
    let hi = payload_or_zero(src.get(j).copied());
    if shift == 0 {
        return hi;
    }
    let lo = payload_or_zero(src.get(j + 1).copied());
    ((hi << (2 * shift)) & PAYLOAD_MASK) | (lo >> (30 - 2 * shift))
}

/// Keep the leading `n` bases of `w`, marking it partial when `n < 15`.
#[inline]
fn finish_word(w: SeqWord, n: usize) -> SeqWord {
    if n >= BASES_PER_WORD {
        return w;
    }
    let keep = PAYLOAD_MASK & !((1u32 << (30 - 2 * n)) - 1);
    (w & keep) | partial_tail(n)
}

/// Append bases `sub_ofs..sub_ofs + sub_len` of `src` to `dst` as a packed run.
///
/// The caller must keep the range within the source sequence.
pub fn sub_sequence(src: &[SeqWord], sub_ofs: usize, sub_len: usize, dst: &mut Vec<SeqWord>) {
    let first = sub_ofs / BASES_PER_WORD;
    let shift = sub_ofs % BASES_PER_WORD;
    let mut remaining = sub_len;
    let mut k = 0;
    while remaining > 0 {
        let n = remaining.min(BASES_PER_WORD);
        dst.push(finish_word(shifted_word(src, first + k, shift), n));
        remaining -= n;
        k += 1;
    }
}

/// [`sub_sequence`] writing over the front of `words`. Returns words now used.
pub fn extract_in_place(words: &mut [SeqWord], sub_ofs: usize, sub_len: usize) -> usize {
    let first = sub_ofs / BASES_PER_WORD;
    let shift = sub_ofs % BASES_PER_WORD;
    let mut remaining = sub_len;
    let mut k = 0;
    while remaining > 0 {
        let n = remaining.min(BASES_PER_WORD);
        // reads words first + k and first + k + 1, never below k
        words[k] = finish_word(shifted_word(words, first + k, shift), n);
        remaining -= n;
        k += 1;
    }
    k
}

/// Trim `trim5` leading and `trim3` trailing bases in place, returning the new length.
pub fn trim_in_place(words: &mut [SeqWord], len: usize, trim5: usize, trim3: usize) -> usize {
    let new_len = len.saturating_sub(trim5 + trim3);
    if new_len > 0 {
        extract_in_place(words, trim5, new_len);
    }
    new_len
}

fn reverse_pairs(w: SeqWord) -> SeqWord {
    let mut x = w & PAYLOAD_MASK;
    let mut r = 0;
    for _ in 0..BASES_PER_WORD {
        r = (r << 2) | (x & 0x03);
        x >>= 2;
    }
    r
}

fn reverse_impl(words: &mut [SeqWord], len: usize, complement: bool) {
    let n = words_for(len);
    if n == 0 {
        return;
    }
    let words = &mut words[..n];
    let pad = n * BASES_PER_WORD - len;
    // terminator and filler pairs become `pad` leading junk bases once reversed
    words[n - 1] &= PAYLOAD_MASK;
    words.reverse();
    for w in words.iter_mut() {
        let r = reverse_pairs(*w);
        *w = if complement { r ^ PAYLOAD_MASK } else { r };
    }
    extract_in_place(words, pad, len);
}

/// Reverse complement a packed run of `len` bases in place.
pub fn reverse_complement_in_place(words: &mut [SeqWord], len: usize) {
    reverse_impl(words, len, true);
}

pub fn reverse_in_place(words: &mut [SeqWord], len: usize) {
    reverse_impl(words, len, false);
}

pub fn complement_in_place(words: &mut [SeqWord], len: usize) {
    let n = words_for(len);
    if n == 0 {
        return;
    }
    let last_bases = len - (n - 1) * BASES_PER_WORD;
    for (i, w) in words[..n].iter_mut().enumerate() {
        let bases = if i + 1 == n { last_bases } else { BASES_PER_WORD };
        let mask = if bases >= BASES_PER_WORD {
            PAYLOAD_MASK
        } else {
            PAYLOAD_MASK & !((1u32 << (30 - 2 * bases)) - 1)
        };
        *w ^= mask;
    }
}

/// Decoded contents of the three header words preceding a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceHeader {
    pub id: u32,
    pub source_file_id: u8,
    pub flags: SeqFlags,
    pub len: u32,
}

impl SequenceHeader {
    pub fn encode(&self) -> [SeqWord; HEADER_WORDS] {
        [
            self.flags.bits() as SeqWord
                | (self.source_file_id as SeqWord) << 16
                | ((self.id >> 6) & 0x0300_0000)
                | MSW_HDR,
            (self.id & PAYLOAD_MASK) | LSW_HDR,
            (self.len & PAYLOAD_MASK) | LSW_HDR,
        ]
    }

    /// Parse a header starting at `words[0]`; `None` unless all three words are tagged.
    pub fn decode(words: &[SeqWord]) -> Option<Self> {
        let (w1, w2, w3) = match words {
            [w1, w2, w3, ..] => (*w1, *w2, *w3),
            _ => return None,
        };
        if !is_header_start(w1) || w2 & KIND_MASK != LSW_HDR || w3 & KIND_MASK != LSW_HDR {
            return None;
        }
        Some(Self {
            id: ((w1 << 6) & 0xC000_0000) | (w2 & PAYLOAD_MASK),
            source_file_id: ((w1 >> 16) & 0xFF) as u8,
            flags: SeqFlags::from_bits((w1 & 0xFFFF) as u16),
            len: w3 & PAYLOAD_MASK,
        })
    }
}
