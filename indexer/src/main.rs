use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use title_index::corpus::CorpusSchema;
use title_index::snapshot::SnapshotReader;
use title_index::tokenizer::tokenize;
use title_index::{CorruptPolicy, Pipeline, PipelineConfig, RunReport};
use tracing_subscriber::{fmt, EnvFilter};

const MANIFEST_VERSION: u32 = 1;

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build a title token inverted index with chunked map-reduce", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index from a delimited corpus
    Build(BuildArgs),
    /// Print the snapshot records for the given tokens
    Lookup {
        /// Snapshot written by `build`
        #[arg(long)]
        snapshot: PathBuf,
        /// Tokens to look up; they are normalized the same way titles are
        #[arg(required = true)]
        tokens: Vec<String>,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Corpus file (e.g. title.basics.tsv)
    #[arg(long)]
    input: PathBuf,
    /// Snapshot file to create or replace
    #[arg(long)]
    output: PathBuf,
    /// Directory for staged partial indexes; cleared at the start of the run
    #[arg(long, default_value = "./intermediate_output")]
    intermediate: PathBuf,
    /// Records per chunk
    #[arg(long, default_value_t = 100_000)]
    chunk_size: usize,
    /// Worker threads (0 = one per core)
    #[arg(long, default_value_t = 0)]
    workers: usize,
    /// Only index the first N chunks
    #[arg(long)]
    max_chunks: Option<usize>,
    /// Field delimiter
    #[arg(long, default_value_t = '\t')]
    delimiter: char,
    /// Zero-based position of the document id
    #[arg(long, default_value_t = 0)]
    id_field: usize,
    /// Zero-based position of the text to index
    #[arg(long, default_value_t = 2)]
    text_field: usize,
    /// Rows with fewer fields are skipped
    #[arg(long, default_value_t = 4)]
    min_fields: usize,
    /// The first line is data, not a header
    #[arg(long, default_value_t = false)]
    no_header: bool,
    /// Write snapshot records ordered by token
    #[arg(long, default_value_t = false)]
    sort_tokens: bool,
    /// Skip staged partials that fail to decode instead of aborting
    #[arg(long, default_value_t = false)]
    skip_corrupt: bool,
    /// Extra attempts for failed intermediate store reads and writes
    #[arg(long, default_value_t = 0)]
    io_retries: u32,
    /// Abort the run after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Delete staged partials after a successful run
    #[arg(long, default_value_t = false)]
    clean_intermediate: bool,
}

impl BuildArgs {
    fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.input, self.intermediate, self.output, self.chunk_size);
        config.workers = self.workers;
        config.max_chunks = self.max_chunks;
        config.schema = CorpusSchema {
            delimiter: self.delimiter,
            id_field: self.id_field,
            text_field: self.text_field,
            min_fields: self.min_fields,
            has_header: !self.no_header,
        };
        config.sort_tokens = self.sort_tokens;
        config.on_corrupt = if self.skip_corrupt { CorruptPolicy::Skip } else { CorruptPolicy::Abort };
        config.io_retries = self.io_retries;
        config.timeout = self.timeout_secs.map(Duration::from_secs);
        config.clean_intermediate = self.clean_intermediate;
        config
    }
}

#[derive(Serialize)]
struct RunManifest<'a> {
    version: u32,
    created_at: String,
    config: &'a PipelineConfig,
    report: &'a RunReport,
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build(args) => build_index(args.into_config()),
        Commands::Lookup { snapshot, tokens } => lookup(&snapshot, &tokens),
    }
}

fn build_index(config: PipelineConfig) -> Result<()> {
    let pipeline = Pipeline::new(config).context("invalid build configuration")?;
    let config = pipeline.config();
    let report = pipeline
        .run()
        .with_context(|| format!("index build of {} failed", config.input.display()))?;

    let manifest_path = manifest_path(&config.output);
    save_manifest(&manifest_path, config, &report)
        .with_context(|| format!("cannot write {}", manifest_path.display()))?;

    tracing::info!(
        output = %config.output.display(),
        tokens = report.tokens,
        chunks = report.chunks,
        skipped_records = report.skipped_records,
        "done"
    );
    Ok(())
}

fn manifest_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    output.with_file_name(name)
}

fn save_manifest(path: &Path, config: &PipelineConfig, report: &RunReport) -> Result<()> {
    let manifest = RunManifest {
        version: MANIFEST_VERSION,
        created_at: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "".into()),
        config,
        report,
    };
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(path, json)?;
    Ok(())
}

fn lookup(snapshot: &Path, tokens: &[String]) -> Result<()> {
    let wanted: HashSet<String> = tokens.iter().flat_map(|t| tokenize(t)).collect();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut found = 0usize;
    for record in SnapshotReader::open(snapshot)? {
        let record = record?;
        if wanted.contains(&record.token) {
            serde_json::to_writer(&mut out, &record)?;
            writeln!(out)?;
            found += 1;
        }
    }
    tracing::debug!(requested = wanted.len(), found, "lookup finished");
    Ok(())
}
