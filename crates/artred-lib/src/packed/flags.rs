//! Per-sequence 16-bit flag words.

use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicU16, Ordering};

/// Flag bits carried in a sequence header and mirrored in the side flag array.
///
/// The top seven bits hold an overlap percentage (0..=127) rather than
/// independent flags; see [`SeqFlags::merge`] for how it is updated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SeqFlags(u16);

impl SeqFlags {
    pub const NONE: SeqFlags = SeqFlags(0);
    /// Sequence is one mate of a pair
    pub const PE: SeqFlags = SeqFlags(0x0001);
    /// Sequence is mate 2 (always the even id of the pair)
    pub const PE2: SeqFlags = SeqFlags(0x0002);
    /// 5' end overlapped by another sequence
    pub const FIVE_PRIME: SeqFlags = SeqFlags(0x0004);
    /// 3' end overlaps another sequence
    pub const THREE_PRIME: SeqFlags = SeqFlags(0x0008);
    /// Already classified in the current overlap phase
    pub const NO_PROC: SeqFlags = SeqFlags(0x0010);
    /// No duplicate found
    pub const UNIQUE: SeqFlags = SeqFlags(0x0020);
    /// Lowest-id member of a duplicate cluster
    pub const FIRST_DUP: SeqFlags = SeqFlags(0x0040);
    /// Duplicate of a lower-id sequence
    pub const NTH_DUP: SeqFlags = SeqFlags(0x0080);
    /// Marked for removal at the next compaction
    pub const REMOVE: SeqFlags = SeqFlags(0x0100);

    // assembly-state aliases sharing the low bits
    pub const ASMB_SEED: SeqFlags = SeqFlags(0x0004);
    pub const ASMB_EXTN: SeqFlags = SeqFlags(0x0008);
    pub const ASMB_CPLT: SeqFlags = SeqFlags(0x0010);
    pub const NON_OVERLAP: SeqFlags = SeqFlags(0x0020);
    pub const CONTAIN_REMOVE: SeqFlags = SeqFlags(0x0040);

    /// Bits holding the overlap percentage
    pub const OVERLAP_PCT_MASK: u16 = 0xFE00;
    const OVERLAP_PCT_SHIFT: u16 = 9;

    /// Pairing bits kept when flags are reset between passes
    pub const PAIRING: SeqFlags = SeqFlags(0x0003);

    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        SeqFlags(bits)
    }

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// All bits of `other` are set.
    #[inline]
    pub const fn contains(self, other: SeqFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set.
    #[inline]
    pub const fn intersects(self, other: SeqFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn overlap_pct(self) -> u8 {
        ((self.0 & Self::OVERLAP_PCT_MASK) >> Self::OVERLAP_PCT_SHIFT) as u8
    }

    /// Replace the overlap percentage; values above 127 saturate.
    pub fn with_overlap_pct(self, pct: u8) -> Self {
        let pct = pct.min(127) as u16;
        SeqFlags((self.0 & !Self::OVERLAP_PCT_MASK) | (pct << Self::OVERLAP_PCT_SHIFT))
    }

    /// Clear `reset`, then merge in `set`.
    ///
    /// The overlap percentage in `set` replaces the stored one unless it is
    /// numerically smaller, in which case only the other bits of `set` apply.
    pub fn merge(self, set: SeqFlags, reset: SeqFlags) -> SeqFlags {
        let cur = self.0 & !reset.0;
        let mask = Self::OVERLAP_PCT_MASK;
        if set.0 & mask < cur & mask {
            SeqFlags(cur | (set.0 & !mask))
        } else {
            SeqFlags((cur & !mask) | set.0)
        }
    }
}

impl BitOr for SeqFlags {
    type Output = SeqFlags;
    fn bitor(self, rhs: SeqFlags) -> SeqFlags {
        SeqFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SeqFlags {
    fn bitor_assign(&mut self, rhs: SeqFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SeqFlags {
    type Output = SeqFlags;
    fn bitand(self, rhs: SeqFlags) -> SeqFlags {
        SeqFlags(self.0 & rhs.0)
    }
}

impl Not for SeqFlags {
    type Output = SeqFlags;
    fn not(self) -> SeqFlags {
        SeqFlags(!self.0)
    }
}

/// Side array of flag words indexed by sequence id, updated lock-free.
///
/// Each update is a compare-and-swap loop on a single word, so concurrent
/// detector threads never contend on anything wider than one sequence.
#[derive(Debug, Default)]
pub struct FlagTable {
    flags: Vec<AtomicU16>,
}

impl FlagTable {
    pub fn with_capacity(n: usize) -> Self {
        Self { flags: Vec::with_capacity(n) }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub(crate) fn push(&mut self, flags: SeqFlags) {
        self.flags.push(AtomicU16::new(flags.bits()));
    }

    pub(crate) fn try_reserve(&mut self, additional: usize) -> Result<(), std::collections::TryReserveError> {
        self.flags.try_reserve(additional)
    }

    pub(crate) fn clear(&mut self) {
        self.flags.clear();
    }

    /// Flags of `id` (1-based); empty for ids outside the table.
    #[inline]
    pub fn get(&self, id: u32) -> SeqFlags {
        self.slot(id).map_or(SeqFlags::NONE, |f| SeqFlags(f.load(Ordering::Acquire)))
    }

    /// Atomically merge `set`/`reset` into the flags of `id`, returning the new value.
    pub fn update(&self, id: u32, set: SeqFlags, reset: SeqFlags) -> SeqFlags {
        let Some(slot) = self.slot(id) else {
            return SeqFlags::NONE;
        };
        let prev = slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(SeqFlags(cur).merge(set, reset).bits())
            })
            .unwrap_or_else(|cur| cur);
        SeqFlags(prev).merge(set, reset)
    }

    /// Atomically set `flag` on `id`; false if it was already set or `id` is unknown.
    pub fn set_if_absent(&self, id: u32, flag: SeqFlags) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            let cur = SeqFlags(cur);
            (!cur.contains(flag)).then(|| cur.merge(flag, SeqFlags::NONE).bits())
        })
        .is_ok()
    }

    /// Apply `set`/`reset` to every sequence.
    pub fn update_all(&self, set: SeqFlags, reset: SeqFlags) {
        for f in &self.flags {
            let _ = f.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(SeqFlags(cur).merge(set, reset).bits())
            });
        }
    }

    /// Count of sequences whose flags contain all of `mask`.
    pub fn count_with(&self, mask: SeqFlags) -> usize {
        self.flags.iter().filter(|f| SeqFlags(f.load(Ordering::Relaxed)).contains(mask)).count()
    }

    #[inline]
    fn slot(&self, id: u32) -> Option<&AtomicU16> {
        (id as usize).checked_sub(1).and_then(|i| self.flags.get(i))
    }
}

/// Upper bound on flag updates buffered by one worker before flushing
pub const MAX_MULTI_SEQ_FLAGS: usize = 4000;

/// Flag updates a worker defers until the end of its claimed block.
#[derive(Debug, Default)]
pub struct FlagBatch {
    pending: Vec<(u32, SeqFlags, SeqFlags)>,
}

impl FlagBatch {
    pub fn new() -> Self {
        Self { pending: Vec::with_capacity(MAX_MULTI_SEQ_FLAGS) }
    }

    /// Queue an update, flushing first if the batch is full.
    pub fn push(&mut self, table: &FlagTable, id: u32, set: SeqFlags, reset: SeqFlags) {
        if self.pending.len() >= MAX_MULTI_SEQ_FLAGS {
            self.flush(table);
        }
        self.pending.push((id, set, reset));
    }

    pub fn flush(&mut self, table: &FlagTable) {
        for (id, set, reset) in self.pending.drain(..) {
            table.update(id, set, reset);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_resets_then_sets() {
        let f = SeqFlags::PE | SeqFlags::UNIQUE;
        let merged = f.merge(SeqFlags::FIRST_DUP, SeqFlags::UNIQUE);
        assert_eq!(merged, SeqFlags::PE | SeqFlags::FIRST_DUP);
    }

    #[test]
    fn test_merge_keeps_larger_overlap_pct() {
        let stored = SeqFlags::FIVE_PRIME.with_overlap_pct(60);
        let smaller = SeqFlags::THREE_PRIME.with_overlap_pct(40);
        let merged = stored.merge(smaller, SeqFlags::NONE);
        assert_eq!(merged.overlap_pct(), 60);
        assert!(merged.contains(SeqFlags::FIVE_PRIME | SeqFlags::THREE_PRIME));

        let larger = SeqFlags::NONE.with_overlap_pct(90);
        assert_eq!(stored.merge(larger, SeqFlags::NONE).overlap_pct(), 90);
    }

    #[test]
    fn test_merge_zero_pct_leaves_stored_pct() {
        let stored = SeqFlags::NONE.with_overlap_pct(33);
        assert_eq!(stored.merge(SeqFlags::REMOVE, SeqFlags::NONE).overlap_pct(), 33);
    }

    #[test]
    fn test_overlap_pct_saturates() {
        assert_eq!(SeqFlags::NONE.with_overlap_pct(200).overlap_pct(), 127);
    }

    #[test]
    fn test_flag_table_update_and_bounds() {
        let mut table = FlagTable::with_capacity(2);
        table.push(SeqFlags::PE);
        table.push(SeqFlags::PE | SeqFlags::PE2);
        let updated = table.update(2, SeqFlags::NTH_DUP, SeqFlags::NONE);
        assert!(updated.contains(SeqFlags::NTH_DUP | SeqFlags::PE2));
        assert_eq!(table.get(2), updated);
        assert_eq!(table.get(0), SeqFlags::NONE);
        assert_eq!(table.get(3), SeqFlags::NONE);
        assert_eq!(table.count_with(SeqFlags::PE), 2);
        assert!(table.set_if_absent(1, SeqFlags::REMOVE));
        assert!(!table.set_if_absent(1, SeqFlags::REMOVE));
        assert!(!table.set_if_absent(9, SeqFlags::REMOVE));
    }

    #[test]
    fn test_flag_table_concurrent_updates() {
        let mut table = FlagTable::with_capacity(1);
        table.push(SeqFlags::NONE);
        let bits = [SeqFlags::FIVE_PRIME, SeqFlags::THREE_PRIME, SeqFlags::REMOVE, SeqFlags::UNIQUE];
        std::thread::scope(|s| {
            for bit in bits {
                let table = &table;
                s.spawn(move || {
                    for _ in 0..1000 {
                        table.update(1, bit, SeqFlags::NONE);
                    }
                });
            }
        });
        let all = bits.into_iter().fold(SeqFlags::NONE, |a, b| a | b);
        assert_eq!(table.get(1), all);
    }

    #[test]
    fn test_batch_flushes_into_table() {
        let mut table = FlagTable::with_capacity(3);
        for _ in 0..3 {
            table.push(SeqFlags::NONE);
        }
        let mut batch = FlagBatch::new();
        batch.push(&table, 1, SeqFlags::UNIQUE, SeqFlags::NONE);
        batch.push(&table, 3, SeqFlags::FIRST_DUP, SeqFlags::NONE);
        assert_eq!(table.get(1), SeqFlags::NONE);
        batch.flush(&table);
        assert!(batch.is_empty());
        assert_eq!(table.get(1), SeqFlags::UNIQUE);
        assert_eq!(table.get(3), SeqFlags::FIRST_DUP);
    }
}
