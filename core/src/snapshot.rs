use crate::aggregate::TokenMultimap;
use crate::error::{IndexError, Result, Stage};
use crate::index::{DocId, DocSet};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One line of the final snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub token: String,
    pub documents: Vec<DocId>,
    pub document_count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    /// Emit records ordered by token instead of table order.
    pub sort_tokens: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub tokens: usize,
    pub postings: usize,
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Drain the aggregate into an NDJSON snapshot at `path`.
///
/// Records go to a hidden temporary file next to `path`, which replaces
/// `path` only after it has been fully written and synced. On failure the
/// previous snapshot, if any, is left as it was.
pub fn write_snapshot(aggregate: TokenMultimap, path: &Path, options: SnapshotOptions) -> Result<SnapshotStats> {
    let tmp = temp_path(path);
    let written = write_to(aggregate, path, &tmp, options);
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    let stats = written?;
    tracing::info!(path = %path.display(), tokens = stats.tokens, postings = stats.postings, "wrote snapshot");
    Ok(stats)
}

/// Errors name the path that actually failed: the parent directory, the
/// temporary file, or `path` itself for the final rename.
fn write_to(aggregate: TokenMultimap, path: &Path, tmp: &Path, options: SnapshotOptions) -> Result<SnapshotStats> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| IndexError::io(Stage::Write, parent, e))?;
    }
    let on_tmp = |e: io::Error| IndexError::io(Stage::Write, tmp, e);
    let mut out = BufWriter::new(File::create(tmp).map_err(on_tmp)?);
    let stats = if options.sort_tokens {
        let mut entries: Vec<(String, DocSet)> = aggregate.into_entries().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        write_records(&mut out, entries).map_err(on_tmp)?
    } else {
        write_records(&mut out, aggregate.into_entries()).map_err(on_tmp)?
    };
    let file = out.into_inner().map_err(|e| on_tmp(e.into_error()))?;
    file.sync_all().map_err(on_tmp)?;
    fs::rename(tmp, path).map_err(|e| IndexError::io(Stage::Write, path, e))?;
    Ok(stats)
}

fn write_records<W, I>(out: &mut W, entries: I) -> io::Result<SnapshotStats>
where
    W: Write,
    I: IntoIterator<Item = (String, DocSet)>,
{
    let mut stats = SnapshotStats::default();
    for (token, docs) in entries {
        let mut documents: Vec<DocId> = docs.into_iter().collect();
        documents.sort_unstable();
        let record = SnapshotRecord { document_count: documents.len(), token, documents };
        serde_json::to_writer(&mut *out, &record)?;
        out.write_all(b"\n")?;
        stats.tokens += 1;
        stats.postings += record.document_count;
    }
    Ok(stats)
}

/// Streaming reader over a snapshot file; blank lines are ignored.
pub struct SnapshotReader {
    lines: io::Lines<BufReader<File>>,
    path: PathBuf,
    line: u64,
}

impl SnapshotReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let f = File::open(&path).map_err(|e| IndexError::io(Stage::Read, &path, e))?;
        Ok(Self { lines: BufReader::new(f).lines(), path, line: 0 })
    }
}

impl Iterator for SnapshotReader {
    type Item = Result<SnapshotRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line += 1;
            let text = match line {
                Ok(text) => text,
                Err(e) => return Some(Err(IndexError::io(Stage::Read, &self.path, e))),
            };
            if text.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&text)
                    .map_err(|e| IndexError::decode(&self.path, format!("line {}: {e}", self.line))),
            );
        }
    }
}

pub fn read_snapshot<P: AsRef<Path>>(path: P) -> Result<Vec<SnapshotRecord>> {
    SnapshotReader::open(path)?.collect()
}
