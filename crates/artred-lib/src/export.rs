//! Output artefacts: retained sequences as FASTA and the duplicate
//! distribution CSV.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

use crate::dedup::DedupReport;
use crate::error::{ArtredError, Result};
use crate::packed::{PackedStore, SeqFlags};

/// Bases per FASTA sequence line
pub const FASTA_LINE_LEN: usize = 76;

/// Counts of sequences written per output file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FastaStats {
    pub r1_seqs: u64,
    pub r2_seqs: u64,
    pub r1_bases: u64,
    pub r2_bases: u64,
}

/// `<prefix><suffix>` without treating anything in the prefix as an extension.
pub fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

struct FastaFile {
    path: PathBuf,
    out: BufWriter<File>,
    line: Vec<u8>,
}

impl FastaFile {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|e| ArtredError::io(&path, e))?;
        Ok(Self { path, out: BufWriter::with_capacity(1024 * 1024, file), line: Vec::with_capacity(FASTA_LINE_LEN + 1) })
    }

    fn write_record(&mut self, descriptor: std::fmt::Arguments<'_>, bases: &[u8]) -> Result<()> {
        let path = &self.path;
        writeln!(self.out, ">{descriptor}").map_err(|e| ArtredError::io(path, e))?;
        for chunk in bases.chunks(FASTA_LINE_LEN) {
            self.line.clear();
            self.line.extend_from_slice(chunk);
            self.line.push(b'\n');
            self.out.write_all(&self.line).map_err(|e| ArtredError::io(path, e))?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.out.flush().map_err(|e| ArtredError::io(&self.path, e))
    }
}

/// Write every sequence in `store` to `<prefix>.R1.fasta`, and mate 2 reads to
/// `<prefix>.R2.fasta` when the store is paired. Mate 2 reads are restored to
/// their sequenced orientation.
pub fn write_fasta(store: &PackedStore, prefix: &Path, paired: bool) -> Result<FastaStats> {
    let start = Instant::now();
    let mut r1 = FastaFile::create(with_suffix(prefix, ".R1.fasta"))?;
    let mut r2 = if paired { Some(FastaFile::create(with_suffix(prefix, ".R2.fasta"))?) } else { None };
    let mut stats = FastaStats::default();

    for id in 1..=store.num_seqs() {
        let (Some(header), Some(mut bases)) = (store.header(id), store.sequence(id)) else {
            continue;
        };
        let fid = header.source_file_id;
        let len = header.len;
        let flags = store.flags().get(id);
        if flags.contains(SeqFlags::PE2) {
            let Some(out) = r2.as_mut() else {
                continue;
            };
            revcpl_ascii(&mut bases);
            stats.r2_seqs += 1;
            stats.r2_bases += len as u64;
            out.write_record(
                format_args!("Seq{}|{}/2 {}|{}|PE|2", stats.r2_seqs, fid.saturating_sub(1), len, fid),
                &bases,
            )?;
        } else {
            stats.r1_seqs += 1;
            stats.r1_bases += len as u64;
            if flags.contains(SeqFlags::PE) {
                r1.write_record(format_args!("Seq{}|{}/1 {}|{}|PE|1", stats.r1_seqs, fid, len, fid), &bases)?;
            } else {
                r1.write_record(format_args!("Seq{}|{} {}|{}|SE", stats.r1_seqs, fid, len, fid), &bases)?;
            }
        }
    }
    r1.finish()?;
    if let Some(r2) = r2 {
        r2.finish()?;
    }
    info!(
        "Wrote {} R1 and {} R2 sequences as FASTA in {:.2}s",
        stats.r1_seqs,
        stats.r2_seqs,
        start.elapsed().as_secs_f64()
    );
    Ok(stats)
}

fn revcpl_ascii(bases: &mut [u8]) {
    bases.reverse();
    for b in bases.iter_mut() {
        *b = match *b {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            other => other,
        };
    }
}

/// Write `<prefix>.dist.csv` holding the count of probes per copy number.
pub fn write_dup_distribution(prefix: &Path, report: &DedupReport) -> Result<PathBuf> {
    let path = with_suffix(prefix, ".dist.csv");
    let file = File::create(&path).map_err(|e| ArtredError::io(&path, e))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "\"Copies\",\"NumInstances\"").map_err(|e| ArtredError::io(&path, e))?;
    for (copies, instances) in report.distribution() {
        writeln!(out, "{copies},{instances}").map_err(|e| ArtredError::io(&path, e))?;
    }
    out.flush().map_err(|e| ArtredError::io(&path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_with_suffix_keeps_dots() {
        assert_eq!(with_suffix(Path::new("out/run.v1"), ".R1.fasta"), PathBuf::from("out/run.v1.R1.fasta"));
    }

    #[test]
    fn test_single_end_layout() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("reduced");
        let mut store = PackedStore::new();
        let long = "ACGT".repeat(40);
        store.append(3, SeqFlags::NONE, long.as_bytes()).unwrap();
        store.append(3, SeqFlags::NONE, b"GATTACA").unwrap();
        let stats = write_fasta(&store, &prefix, false).unwrap();
        assert_eq!(stats.r1_seqs, 2);
        assert!(!with_suffix(&prefix, ".R2.fasta").exists());

        let text = std::fs::read_to_string(with_suffix(&prefix, ".R1.fasta")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ">Seq1|3 160|3|SE");
        assert_eq!(lines[1].len(), 76);
        assert_eq!(lines[2].len(), 76);
        assert_eq!(lines[3].len(), 8);
        assert_eq!(lines[4], ">Seq2|3 7|3|SE");
        assert_eq!(lines[5], "GATTACA");
    }

    #[test]
    fn test_paired_layout_restores_mate2() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("pairs");
        let mut store = PackedStore::new();
        store.append(1, SeqFlags::PE, b"AAAACCCC").unwrap();
        let id2 = store.append(2, SeqFlags::PE | SeqFlags::PE2, b"GGGTTTAC").unwrap();
        store.reverse_complement(id2).unwrap();
        let stats = write_fasta(&store, &prefix, true).unwrap();
        assert_eq!((stats.r1_seqs, stats.r2_seqs), (1, 1));

        let r1 = std::fs::read_to_string(with_suffix(&prefix, ".R1.fasta")).unwrap();
        assert_eq!(r1, ">Seq1|1/1 8|1|PE|1\nAAAACCCC\n");
        let r2 = std::fs::read_to_string(with_suffix(&prefix, ".R2.fasta")).unwrap();
        assert_eq!(r2, ">Seq1|1/2 8|2|PE|2\nGGGTTTAC\n");
    }

    #[test]
    fn test_dup_distribution_csv() {
        let dir = TempDir::new().unwrap();
        let report = DedupReport { probes: 10, duplicates: 6, histogram: vec![0, 4, 1], self_misses: 0 };
        let path = write_dup_distribution(&dir.path().join("dups"), &report).unwrap();
        assert!(path.ends_with("dups.dist.csv"));
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text, "\"Copies\",\"NumInstances\"\n2,4\n3,1\n");
    }
}
