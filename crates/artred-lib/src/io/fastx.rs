use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::collab::ReadSource;
use crate::error::{ArtredError, Result};

/// A FASTA or FASTQ record with byte-oriented fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastxRecord {
    /// Descriptor line without the leading `>` or `@`
    pub id: Vec<u8>,
    pub sequence: Vec<u8>,
    /// Present for FASTQ only
    pub quality: Option<Vec<u8>>,
}

impl FastxRecord {
    pub fn new(id: Vec<u8>, sequence: Vec<u8>, quality: Option<Vec<u8>>) -> Self {
        Self { id, sequence, quality }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Fasta,
    Fastq,
}

// Either a plain or a gzipped file
pub enum FileReader {
    Plain(BufReader<File>),
    Gzipped(BufReader<GzDecoder<BufReader<File>>>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            FileReader::Plain(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

impl BufRead for FileReader {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        match self {
            FileReader::Plain(r) => r.fill_buf(),
            FileReader::Gzipped(r) => r.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            FileReader::Plain(r) => r.consume(amt),
            FileReader::Gzipped(r) => r.consume(amt),
        }
    }
}

/// Reader over FASTA (single or multi-line) or FASTQ, format sniffed from the first record.
pub struct FastxReader<R: BufRead> {
    reader: R,
    path: PathBuf,
    format: Option<Format>,
    compressed: bool,
    buffer: Vec<u8>,
    pending_header: Option<Vec<u8>>,
    bytes_read: u64,
}

impl FastxReader<FileReader> {
    /// Open a FASTA/FASTQ file (auto-detects gzip)
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ArtredError::io(path, e))?;

        let mut buffered = BufReader::with_capacity(4 * 1024 * 1024, file);
        let is_gzipped = {
            let peek = buffered.fill_buf().map_err(|e| ArtredError::io(path, e))?;
            peek.len() >= 2 && peek[0] == 0x1f && peek[1] == 0x8b
        };

        let reader = if is_gzipped {
            FileReader::Gzipped(BufReader::new(GzDecoder::new(buffered)))
        } else {
            FileReader::Plain(buffered)
        };
        let mut this = Self::new(reader, path);
        this.compressed = is_gzipped;
        Ok(this)
    }
}

impl<R: BufRead> FastxReader<R> {
    /// Wrap any `BufRead`; `path` is used only for error context.
    pub fn new(reader: R, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            path: path.into(),
            format: None,
            compressed: false,
            buffer: Vec::with_capacity(512),
            pending_header: None,
            bytes_read: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the underlying file is gzip compressed
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Decompressed bytes consumed so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    #[inline]
    fn trim_newline(buf: &mut Vec<u8>) {
        while buf.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            buf.pop();
        }
    }

    /// Read one line into the buffer, returning false at EOF.
    fn read_line(&mut self) -> Result<bool> {
        self.buffer.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buffer)
            .map_err(|e| ArtredError::io(&self.path, e))?;
        self.bytes_read += n as u64;
        Self::trim_newline(&mut self.buffer);
        Ok(n > 0)
    }

    fn malformed(&self, reason: impl Into<String>) -> ArtredError {
        ArtredError::malformed(&self.path, reason)
    }

    /// Read the next record
    pub fn next(&mut self) -> Result<Option<FastxRecord>> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => loop {
                if !self.read_line()? {
                    return Ok(None);
                }
                if !self.buffer.is_empty() {
                    break self.buffer.clone();
                }
            },
        };

        let format = match (self.format, header.first()) {
            (Some(f), _) => f,
            (None, Some(b'>')) => Format::Fasta,
            (None, Some(b'@')) => Format::Fastq,
            _ => return Err(self.malformed("expected '>' or '@' at start of first record")),
        };
        self.format = Some(format);

        match format {
            Format::Fasta => self.next_fasta(header).map(Some),
            Format::Fastq => self.next_fastq(header).map(Some),
        }
    }

    fn next_fasta(&mut self, header: Vec<u8>) -> Result<FastxRecord> {
        if header.first() != Some(&b'>') {
            return Err(self.malformed(format!(
                "expected '>' descriptor, got {:?}",
                String::from_utf8_lossy(&header)
            )));
        }
        let mut sequence = Vec::new();
        while self.read_line()? {
            if self.buffer.first() == Some(&b'>') {
                self.pending_header = Some(self.buffer.clone());
                break;
            }
            sequence.extend(self.buffer.iter().filter(|b| !b.is_ascii_whitespace()));
        }
        Ok(FastxRecord::new(header[1..].to_vec(), sequence, None))
    }

    fn next_fastq(&mut self, header: Vec<u8>) -> Result<FastxRecord> {
        if header.first() != Some(&b'@') {
            return Err(self.malformed(format!(
                "expected '@' descriptor, got {:?}",
                String::from_utf8_lossy(&header)
            )));
        }
        if !self.read_line()? {
            return Err(self.malformed("unexpected EOF at sequence line"));
        }
        let sequence = self.buffer.clone();

        if !self.read_line()? || self.buffer.first() != Some(&b'+') {
            return Err(self.malformed("expected '+' separator line"));
        }

        if !self.read_line()? {
            return Err(self.malformed("unexpected EOF at quality line"));
        }
        let quality = self.buffer.clone();
        if quality.len() != sequence.len() {
            return Err(self.malformed(format!(
                "sequence length ({}) != quality length ({}) for read {}",
                sequence.len(),
                quality.len(),
                String::from_utf8_lossy(&header[1..])
            )));
        }
        Ok(FastxRecord::new(header[1..].to_vec(), sequence, Some(quality)))
    }
}

impl<R: BufRead> ReadSource for FastxReader<R> {
    fn next_read(&mut self) -> Result<Option<FastxRecord>> {
        self.next()
    }

    fn bytes_consumed(&self) -> u64 {
        self.bytes_read
    }
}
