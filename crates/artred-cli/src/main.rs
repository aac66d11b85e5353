use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use artred_lib::cli::{OutputMode, QualitySchema, ReadFilterConfig, ReduceConfig};
use artred_lib::collab::TsvSink;
use artred_lib::lifecycle::ArtefactReducer;

#[derive(Parser)]
#[command(name = "artred")]
#[command(author = "Artred Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Duplicate and non-overlapping read reduction for assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deduplicate reads and remove reads without overlaps
    Reduce(ReduceArgs),
    /// Convert a packed file to FASTA
    Unpack(UnpackArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum CliFormat {
    /// Multi-FASTA, one file per mate when paired
    Fasta,
    /// Packed format, loadable as a checkpoint
    Packed,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum CliQuality {
    Illumina,
    Solexa,
    Sanger,
    /// Do not inspect quality scores
    Ignore,
}

#[derive(Parser)]
struct ReduceArgs {
    /// Input FASTA/FASTQ files (single-end or mate 1); wildcards allowed
    #[arg(short, long, value_name = "FILE", required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Mate 2 input files, paired with --input in order
    #[arg(short = 'u', long, value_name = "FILE", num_args = 1..)]
    pe2: Vec<PathBuf>,

    /// Output path prefix
    #[arg(short, long, value_name = "PREFIX", required = true)]
    output: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "fasta")]
    format: CliFormat,

    /// Packed checkpoint: resumed from when valid, written after loading otherwise
    #[arg(short, long, value_name = "FILE")]
    checkpoint: Option<PathBuf>,

    /// Write the duplicate distribution CSV using this prefix
    #[arg(long, value_name = "PREFIX")]
    dedup_dist: Option<PathBuf>,

    /// Append run counts as tab-separated lines to this file
    #[arg(long, value_name = "FILE")]
    results: Option<PathBuf>,

    /// FASTA of contaminant sequences to trim or drop
    #[arg(long, value_name = "FILE")]
    contaminants: Option<PathBuf>,

    /// Skip duplicate removal
    #[arg(long)]
    no_dedupe: bool,

    /// Only the sense strand is considered when deduplicating
    #[arg(long)]
    strand_specific: bool,

    /// Treat mates as independent reads
    #[arg(long)]
    independent_pairs: bool,

    /// Minimum overlap (0 = 80% of mean read length, -1 = no overlap removal)
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    min_overlap: i32,

    /// Minimum flank beyond the overlap
    #[arg(long, default_value = "1")]
    min_flank: u32,

    /// Overlap removal passes (1-5)
    #[arg(long, default_value = "1")]
    passes: u32,

    /// Number of threads (0 = auto-detect)
    #[arg(short = 't', long, default_value = "0")]
    threads: usize,

    /// FASTQ quality encoding
    #[arg(short, long, value_enum, default_value = "sanger")]
    quality: CliQuality,

    /// Minimum mean Phred score (0 = no quality filtering)
    #[arg(long, default_value = "0")]
    min_phred: u32,

    /// Bases trimmed from the 5' end
    #[arg(long, default_value = "0")]
    trim5: u32,

    /// Bases trimmed from the 3' end
    #[arg(long, default_value = "0")]
    trim3: u32,

    /// Most indeterminate bases per 100 bases
    #[arg(long, default_value = "1")]
    max_ns: u32,

    /// Minimum read length after trimming
    #[arg(long, default_value = "50")]
    min_seq_len: u32,

    /// Truncate reads to this length (0 = no truncation)
    #[arg(long, default_value = "0")]
    trim_seq_len: u32,

    /// Only every Nth read is considered
    #[arg(long, default_value = "1")]
    sample_nth: u32,

    /// Most reads accepted per file (0 = no limit)
    #[arg(long, default_value = "0")]
    max_reads: u32,
}

#[derive(Parser)]
struct UnpackArgs {
    /// Input packed file
    #[arg(short, long, value_name = "FILE", required = true)]
    input: PathBuf,

    /// Output path prefix
    #[arg(short, long, value_name = "PREFIX", required = true)]
    output: PathBuf,
}

impl ReduceArgs {
    fn into_config(self) -> ReduceConfig {
        let quality = match self.quality {
            CliQuality::Illumina => QualitySchema::Illumina,
            CliQuality::Solexa => QualitySchema::Solexa,
            CliQuality::Sanger => QualitySchema::Sanger,
            CliQuality::Ignore => QualitySchema::Ignore,
        };
        let mode = match self.format {
            CliFormat::Fasta => OutputMode::Fasta,
            CliFormat::Packed => OutputMode::Packed,
        };
        ReduceConfig {
            mode,
            inputs: self.input,
            pe2_inputs: self.pe2,
            checkpoint: self.checkpoint,
            output: self.output,
            dedup_dist: self.dedup_dist,
            no_dedupe: self.no_dedupe,
            strand_specific: self.strand_specific,
            independent_pairs: self.independent_pairs,
            min_overlap: self.min_overlap,
            min_flank: self.min_flank,
            iterative_passes: self.passes,
            threads: self.threads,
            filter: ReadFilterConfig {
                quality,
                min_phred: self.min_phred,
                trim5: self.trim5,
                trim3: self.trim3,
                max_ns: self.max_ns,
                min_seq_len: self.min_seq_len,
                trim_seq_len: self.trim_seq_len,
                sample_nth: self.sample_nth,
                zreads: self.max_reads,
            },
            contaminants: self.contaminants,
        }
    }
}

impl UnpackArgs {
    fn into_config(self) -> ReduceConfig {
        ReduceConfig {
            mode: OutputMode::PackedToFasta,
            inputs: vec![self.input],
            output: self.output,
            ..ReduceConfig::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Reduce(args) => {
            info!("Starting artefact reduction...");
            let results = args.results.clone();
            let reducer = ArtefactReducer::new(args.into_config())?;
            let summary = match results {
                Some(path) => {
                    let sink = Arc::new(Mutex::new(TsvSink::create(&path)?));
                    let summary = reducer.with_sink(Box::new(Arc::clone(&sink))).process()?;
                    match Arc::try_unwrap(sink) {
                        Ok(sink) => sink.into_inner().finish()?,
                        Err(_) => anyhow::bail!("results file {} still in use", path.display()),
                    }
                    summary
                }
                None => reducer.process()?,
            };
            info!(
                "Reduction complete: {} loaded, {} retained{}",
                summary.loaded,
                summary.retained,
                if summary.resumed { " (resumed from checkpoint)" } else { "" }
            );
        }
        Commands::Unpack(args) => {
            info!("Starting packed to FASTA conversion...");
            let reducer = ArtefactReducer::new(args.into_config())?;
            let summary = reducer.process()?;
            info!("Conversion complete: {} sequences", summary.loaded);
        }
    }

    Ok(())
}
