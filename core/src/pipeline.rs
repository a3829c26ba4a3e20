use crate::aggregate::TokenMultimap;
use crate::chunk::{chunks, Chunk};
use crate::corpus::{CorpusReader, CorpusSchema, RawRecord};
use crate::error::{IndexError, Result};
use crate::index::{to_sorted, SortedIndex};
use crate::map::{index_chunk, map_chunk, MapStats};
use crate::merge::{merge_staged, MergeStats};
use crate::snapshot::{write_snapshot, SnapshotOptions};
use crate::store::{retry_io, IntermediateStore};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to do with a staged partial that cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptPolicy {
    #[default]
    Abort,
    /// Log a warning, leave the partial out and keep merging.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub intermediate_dir: PathBuf,
    pub output: PathBuf,
    pub chunk_size: usize,
    /// Worker threads for both phases; 0 means one per available core.
    pub workers: usize,
    pub max_chunks: Option<usize>,
    pub schema: CorpusSchema,
    pub sort_tokens: bool,
    pub on_corrupt: CorruptPolicy,
    pub io_retries: u32,
    pub timeout: Option<Duration>,
    /// Remove staged partials once the snapshot is written. Otherwise they
    /// stay until the next run resets the store.
    pub clean_intermediate: bool,
}

impl PipelineConfig {
    pub fn new<P, Q, R>(input: P, intermediate_dir: Q, output: R, chunk_size: usize) -> Self
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
        R: Into<PathBuf>,
    {
        Self {
            input: input.into(),
            intermediate_dir: intermediate_dir.into(),
            output: output.into(),
            chunk_size,
            workers: 0,
            max_chunks: None,
            schema: CorpusSchema::default(),
            sort_tokens: false,
            on_corrupt: CorruptPolicy::Abort,
            io_retries: 0,
            timeout: None,
            clean_intermediate: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(IndexError::config("chunk_size must be positive"));
        }
        if self.max_chunks == Some(0) {
            return Err(IndexError::config("max_chunks must be positive when set"));
        }
        if self.intermediate_dir == self.output {
            return Err(IndexError::config("intermediate_dir and output must differ"));
        }
        self.schema.validate()
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }
}

/// Shared abort signal with an optional deadline.
///
/// A token made by [`CancelToken::child`] also observes its parent's flag,
/// but cancelling the child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { flag: Arc::default(), parent: None, deadline: Some(Instant::now() + timeout) }
    }

    /// Fresh token linked to this one; its deadline counts from now.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        Self {
            flag: Arc::default(),
            parent: Some(self.flag.clone()),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flagged() || self.timed_out()
    }

    fn flagged(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.load(Ordering::SeqCst))
    }

    fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self, before: &str) -> Result<()> {
        if self.timed_out() {
            return Err(IndexError::Cancelled(format!("timeout elapsed before {before}")));
        }
        if self.flagged() {
            return Err(IndexError::Cancelled(format!("cancelled before {before}")));
        }
        Ok(())
    }
}

/// Keeps the first error reported by any task and cancels the siblings.
struct FirstFailure<'a> {
    cancel: &'a CancelToken,
    error: Mutex<Option<IndexError>>,
}

impl<'a> FirstFailure<'a> {
    fn new(cancel: &'a CancelToken) -> Self {
        Self { cancel, error: Mutex::new(None) }
    }

    fn record(&self, err: IndexError) {
        self.cancel.cancel();
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn into_result(self) -> Result<()> {
        match self.error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub chunks: usize,
    pub records: usize,
    pub skipped_records: usize,
    pub partials_merged: usize,
    pub skipped_partials: Vec<PathBuf>,
    pub tokens: usize,
    pub postings: usize,
    pub elapsed: Duration,
}

/// Chunked map-reduce build of the title token index.
pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancelToken,
    pool: ThreadPool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_count())
            .thread_name(|i| format!("title-index-{i}"))
            .build()
            .map_err(|e| IndexError::config(format!("cannot start worker pool: {e}")))?;
        Ok(Self { config, cancel: CancelToken::new(), pool })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle for aborting runs from another thread. Once cancelled, the
    /// current run and every later one on this pipeline stop early.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Build the snapshot. Each run gets its own cancel token, so a failed
    /// run does not poison the next one and the timeout counts from here.
    pub fn run(&self) -> Result<RunReport> {
        let start = Instant::now();
        let cancel = self.cancel.child(self.config.timeout);
        let store = IntermediateStore::new(&self.config.intermediate_dir);
        store.reset()?;
        tracing::info!(
            input = %self.config.input.display(),
            chunk_size = self.config.chunk_size,
            workers = self.pool.current_num_threads(),
            "starting map phase"
        );

        let mapped = self.map_phase(&store, &cancel)?;
        let report = RunReport {
            chunks: mapped.len(),
            records: mapped.iter().map(|s| s.records).sum(),
            skipped_records: mapped.iter().map(|s| s.skipped).sum(),
            ..RunReport::default()
        };
        tracing::info!(
            chunks = report.chunks,
            records = report.records,
            skipped_records = report.skipped_records,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "map phase complete"
        );
        self.reduce(&store, &cancel, report, start)
    }

    /// Merge whatever the store holds, then write the snapshot.
    fn reduce(
        &self,
        store: &IntermediateStore,
        cancel: &CancelToken,
        mut report: RunReport,
        start: Instant,
    ) -> Result<RunReport> {
        let aggregate = TokenMultimap::new();
        let (merged, skipped) = self.merge_phase(store, &aggregate, cancel)?;
        report.partials_merged = merged.len();
        report.skipped_partials = skipped;
        if report.partials_merged + report.skipped_partials.len() != report.chunks {
            tracing::warn!(
                chunks = report.chunks,
                staged = report.partials_merged + report.skipped_partials.len(),
                "intermediate store does not hold one partial per mapped chunk"
            );
        }
        tracing::info!(
            partials = report.partials_merged,
            skipped = report.skipped_partials.len(),
            tokens = aggregate.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "merge phase complete"
        );

        cancel.check("writing the snapshot")?;
        let options = SnapshotOptions { sort_tokens: self.config.sort_tokens };
        let written = write_snapshot(aggregate, &self.config.output, options)?;
        report.tokens = written.tokens;
        report.postings = written.postings;

        if self.config.clean_intermediate {
            store.reset()?;
        }
        report.elapsed = start.elapsed();
        tracing::info!(elapsed_ms = report.elapsed.as_millis() as u64, "index build complete");
        Ok(report)
    }

    fn map_phase(&self, store: &IntermediateStore, cancel: &CancelToken) -> Result<Vec<MapStats>> {
        let config = &self.config;
        let reader = CorpusReader::open(&config.input, &config.schema)?;
        let pending = chunks(reader, config.chunk_size)?
            .with_limit(config.max_chunks)
            .take_while(|_| !cancel.is_cancelled());

        let failure = FirstFailure::new(cancel);
        let stats: Vec<MapStats> = self.pool.install(|| {
            pending
                .par_bridge()
                .filter_map(|chunk| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let outcome = chunk.and_then(|c| {
                        let chunk_id = c.id;
                        map_chunk(c, &config.schema, store, config.io_retries).inspect_err(|e| {
                            tracing::error!(chunk_id, error = %e, "map task failed");
                        })
                    });
                    outcome.map_err(|e| failure.record(e)).ok()
                })
                .collect()
        });
        failure.into_result()?;
        cancel.check("the merge phase")?;
        Ok(stats)
    }

    fn merge_phase(
        &self,
        store: &IntermediateStore,
        aggregate: &TokenMultimap,
        cancel: &CancelToken,
    ) -> Result<(Vec<MergeStats>, Vec<PathBuf>)> {
        let config = &self.config;
        let staged = retry_io(config.io_retries, || store.list())?;
        tracing::info!(partials = staged.len(), "starting merge phase");

        let failure = FirstFailure::new(cancel);
        let skipped = Mutex::new(Vec::new());
        let merged: Vec<MergeStats> = self.pool.install(|| {
            staged
                .par_iter()
                .filter_map(|partial| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    match merge_staged(store, partial, aggregate, config.io_retries) {
                        Ok(stats) => Some(stats),
                        Err(e @ IndexError::Decode { .. }) if config.on_corrupt == CorruptPolicy::Skip => {
                            tracing::warn!(chunk_id = partial.chunk_id, error = %e, "skipping corrupt partial index");
                            skipped.lock().push(partial.path.clone());
                            None
                        }
                        Err(e) => {
                            tracing::error!(chunk_id = partial.chunk_id, error = %e, "merge task failed");
                            failure.record(e);
                            None
                        }
                    }
                })
                .collect()
        });
        failure.into_result()?;
        cancel.check("the final write")?;
        Ok((merged, skipped.into_inner()))
    }
}

/// Single-threaded build of the whole corpus as one chunk, with no staging.
/// Serves as the reference the chunked pipeline must agree with.
pub fn build_in_memory<I>(records: I, schema: &CorpusSchema) -> Result<SortedIndex>
where
    I: IntoIterator<Item = Result<RawRecord>>,
{
    schema.validate()?;
    let records = records.into_iter().collect::<Result<Vec<_>>>()?;
    let (partial, _) = index_chunk(&Chunk { id: 0, records }, schema);
    Ok(to_sorted(partial.postings))
}
