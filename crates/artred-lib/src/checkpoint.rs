//! Persisted packed sequence file: fixed little-endian header followed by the
//! raw arena words.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::error::{ArtredError, Result};
use crate::lifecycle::CollectionState;
use crate::packed::{PackedStore, SeqFlags};
use crate::reads::{SourceFile, SourceFiles, MAX_PATH_BYTES, MAX_SOURCE_FILES};

pub const MAGIC: [u8; 4] = *b"prds";
pub const VERSION: u32 = 2;
/// Oldest version still loadable
pub const MIN_VERSION: u32 = 1;

const SOURCE_RECORD_LEN: usize = 2 + 4 * 4 + MAX_PATH_BYTES;
const STATE_LEN: usize = 1 + 4 * 5 + 8 + 4 * 4 + 8 + 8 + 4 * 2;
/// Bytes before the arena
pub const HEADER_LEN: usize = 4 + 4 + 8 + 4 + MAX_SOURCE_FILES * SOURCE_RECORD_LEN + STATE_LEN + 8 + 8;

/// Contents of a loaded checkpoint.
#[derive(Debug)]
pub struct Checkpoint {
    pub version: u32,
    pub files: SourceFiles,
    pub state: CollectionState,
    pub store: PackedStore,
}

/// Write `store` with its source file table and collection state to `path`.
///
/// Header flags other than the pairing bits are cleared first.
pub fn write_checkpoint(
    path: &Path,
    store: &mut PackedStore,
    files: &SourceFiles,
    state: &CollectionState,
) -> Result<()> {
    let start = Instant::now();
    store.reset_flags(SeqFlags::PAIRING);
    let words = store.words();
    let file_size = HEADER_LEN as u64 + words.len() as u64 * 4;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&MAGIC);
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.extend_from_slice(&file_size.to_le_bytes());
    header.extend_from_slice(&(files.len() as u32).to_le_bytes());
    let mut records = files.iter();
    for _ in 0..MAX_SOURCE_FILES {
        match records.next() {
            Some(f) => put_source_file(&mut header, f),
            None => header.resize(header.len() + SOURCE_RECORD_LEN, 0),
        }
    }
    put_state(&mut header, state);
    header.extend_from_slice(&(HEADER_LEN as u64).to_le_bytes());
    header.extend_from_slice(&(words.len() as u64).to_le_bytes());
    debug_assert_eq!(header.len(), HEADER_LEN);

    let file = File::create(path).map_err(|e| ArtredError::io(path, e))?;
    let mut out = BufWriter::with_capacity(4 * 1024 * 1024, file);
    out.write_all(&header).map_err(|e| ArtredError::io(path, e))?;
    let mut buf = Vec::with_capacity(64 * 1024);
    for chunk in words.chunks(16 * 1024) {
        buf.clear();
        for w in chunk {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        out.write_all(&buf).map_err(|e| ArtredError::io(path, e))?;
    }
    out.flush().map_err(|e| ArtredError::io(path, e))?;
    info!(
        "Wrote {} sequences ({} bytes) to {} in {:.2}s",
        store.num_seqs(),
        file_size,
        path.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Load and validate a checkpoint. Any structural problem is `CorruptFile`.
pub fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let start = Instant::now();
    let actual_size = std::fs::metadata(path).map_err(|e| ArtredError::io(path, e))?.len();
    if actual_size < HEADER_LEN as u64 {
        return Err(ArtredError::corrupt(path, format!("{actual_size} bytes is shorter than the header")));
    }
    let file = File::open(path).map_err(|e| ArtredError::io(path, e))?;
    let mut input = BufReader::with_capacity(4 * 1024 * 1024, file);
    let mut header = vec![0u8; HEADER_LEN];
    input.read_exact(&mut header).map_err(|e| ArtredError::io(path, e))?;

    let mut r = LeReader::new(&header, path);
    if r.bytes(4)? != MAGIC {
        return Err(ArtredError::corrupt(path, "bad magic"));
    }
    let version = r.u32()?;
    if !(MIN_VERSION..=VERSION).contains(&version) {
        return Err(ArtredError::corrupt(path, format!("unsupported version {version}")));
    }
    let file_size = r.u64()?;
    if file_size != actual_size {
        return Err(ArtredError::corrupt(
            path,
            format!("recorded size {file_size} but file holds {actual_size} bytes"),
        ));
    }
    let num_files = r.u32()? as usize;
    if num_files >= MAX_SOURCE_FILES {
        return Err(ArtredError::corrupt(path, format!("{num_files} source files")));
    }
    let mut records = Vec::with_capacity(num_files);
    for i in 0..MAX_SOURCE_FILES {
        let rec = r.source_file()?;
        if i < num_files {
            records.push(rec);
        }
    }
    let state = r.state()?;
    let arena_offset = r.u64()?;
    let arena_words = r.u64()?;
    if state.num_seqs == 0 {
        return Err(ArtredError::corrupt(path, "no sequences"));
    }
    let arena_end = arena_words.checked_mul(4).and_then(|b| b.checked_add(arena_offset));
    if arena_offset < HEADER_LEN as u64 || arena_end != Some(actual_size) {
        return Err(ArtredError::corrupt(
            path,
            format!("arena of {arena_words} words at offset {arena_offset} outside file"),
        ));
    }

    input.seek(SeekFrom::Start(arena_offset)).map_err(|e| ArtredError::io(path, e))?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact((arena_words * 4) as usize)
        .map_err(|_| ArtredError::OutOfMemory { what: "checkpoint arena", requested: arena_words * 4 })?;
    input.read_to_end(&mut bytes).map_err(|e| ArtredError::io(path, e))?;
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    drop(bytes);

    let store = PackedStore::from_words(words)
        .map_err(|e| ArtredError::corrupt(path, format!("arena failed validation: {e}")))?;
    if store.num_seqs() != state.num_seqs {
        return Err(ArtredError::corrupt(
            path,
            format!("arena holds {} sequences, header records {}", store.num_seqs(), state.num_seqs),
        ));
    }
    info!(
        "Loaded {} sequences from {} in {:.2}s",
        store.num_seqs(),
        path.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(Checkpoint { version, files: SourceFiles::from_records(records), state, store })
}

fn put_source_file(out: &mut Vec<u8>, f: &SourceFile) {
    out.push(f.file_id);
    out.push(f.pe_file_id);
    for v in [f.parsed, f.underlength, f.excess_ns, f.accepted] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    let path = f.path.as_bytes();
    let n = path.len().min(MAX_PATH_BYTES - 1);
    out.extend_from_slice(&path[..n]);
    out.resize(out.len() + MAX_PATH_BYTES - n, 0);
}

fn put_state(out: &mut Vec<u8>, s: &CollectionState) {
    out.push(s.is_paired as u8);
    for v in [s.tot_parsed, s.tot_underlength, s.tot_excess_ns, s.num_duplicates, s.num_overlapping] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&s.num_overlapped.to_le_bytes());
    for v in [s.tot_seqs, s.num_seqs, s.num_pe1, s.num_pe2] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&s.total_len.to_le_bytes());
    out.extend_from_slice(&s.mean_len.to_le_bytes());
    out.extend_from_slice(&s.min_len.to_le_bytes());
    out.extend_from_slice(&s.max_len.to_le_bytes());
}

struct LeReader<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> LeReader<'a> {
    fn new(buf: &'a [u8], path: &'a Path) -> Self {
        Self { buf, pos: 0, path }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| ArtredError::corrupt(self.path, "truncated header"))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut a = [0u8; 8];
        a.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(a))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn source_file(&mut self) -> Result<SourceFile> {
        let file_id = self.u8()?;
        let pe_file_id = self.u8()?;
        let parsed = self.u32()?;
        let underlength = self.u32()?;
        let excess_ns = self.u32()?;
        let accepted = self.u32()?;
        let raw = self.bytes(MAX_PATH_BYTES)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let path = String::from_utf8_lossy(&raw[..end]).into_owned();
        Ok(SourceFile { file_id, pe_file_id, parsed, underlength, excess_ns, accepted, path })
    }

    fn state(&mut self) -> Result<CollectionState> {
        Ok(CollectionState {
            is_paired: self.u8()? != 0,
            tot_parsed: self.u32()?,
            tot_underlength: self.u32()?,
            tot_excess_ns: self.u32()?,
            num_duplicates: self.u32()?,
            num_overlapping: self.u32()?,
            num_overlapped: self.u64()?,
            tot_seqs: self.u32()?,
            num_seqs: self.u32()?,
            num_pe1: self.u32()?,
            num_pe2: self.u32()?,
            total_len: self.u64()?,
            mean_len: self.f64()?,
            min_len: self.u32()?,
            max_len: self.u32()?,
        })
    }
}
