use crate::error::{IndexError, Result, Stage};
use crate::index::PartialIndex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const PARTIAL_PREFIX: &str = "partial-";
const PARTIAL_EXT: &str = "bin";
const TMP_EXT: &str = "tmp";

/// Handle to one staged partial index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPartial {
    pub chunk_id: usize,
    pub path: PathBuf,
}

/// Directory of bincode-encoded partial indexes, one file per chunk.
///
/// Files are written under a temporary name and renamed once synced, so
/// `list` only ever sees complete partials.
#[derive(Debug, Clone)]
pub struct IntermediateStore {
    root: PathBuf,
}

impl IntermediateStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partial_path(&self, chunk_id: usize) -> PathBuf {
        self.root.join(format!("{PARTIAL_PREFIX}{chunk_id:08}.{PARTIAL_EXT}"))
    }

    /// Remove every staged partial, including leftovers of interrupted
    /// writes. Creates the directory if it does not exist yet.
    pub fn reset(&self) -> Result<()> {
        let io_err = |e| IndexError::io(Stage::Stage, &self.root, e);
        fs::create_dir_all(&self.root).map_err(io_err)?;
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(PARTIAL_PREFIX));
            if !owned || !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(IndexError::io(Stage::Stage, &path, e)),
            }
        }
        tracing::debug!(root = %self.root.display(), removed, "reset intermediate store");
        Ok(())
    }

    pub fn put(&self, partial: &PartialIndex) -> Result<StagedPartial> {
        let path = self.partial_path(partial.chunk_id);
        let tmp = path.with_extension(TMP_EXT);
        let bytes = bincode::serialize(partial)
            .map_err(|source| IndexError::Encode { chunk_id: partial.chunk_id, source })?;

        let write = || -> io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(IndexError::io(Stage::Stage, &path, e));
        }
        Ok(StagedPartial { chunk_id: partial.chunk_id, path })
    }

    /// Staged partials ordered by chunk id.
    pub fn list(&self) -> Result<Vec<StagedPartial>> {
        let io_err = |e| IndexError::io(Stage::Merge, &self.root, e);
        let mut staged = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if let Some(chunk_id) = parse_chunk_id(&path) {
                staged.push(StagedPartial { chunk_id, path });
            }
        }
        staged.sort_by_key(|s| s.chunk_id);
        Ok(staged)
    }

    pub fn get(&self, staged: &StagedPartial) -> Result<PartialIndex> {
        let bytes = fs::read(&staged.path).map_err(|e| IndexError::io(Stage::Merge, &staged.path, e))?;
        let partial: PartialIndex =
            bincode::deserialize(&bytes).map_err(|e| IndexError::decode(&staged.path, e))?;
        if partial.chunk_id != staged.chunk_id {
            return Err(IndexError::decode(
                &staged.path,
                format!("file holds chunk {} but is named for chunk {}", partial.chunk_id, staged.chunk_id),
            ));
        }
        Ok(partial)
    }
}

fn parse_chunk_id(path: &Path) -> Option<usize> {
    if path.extension()?.to_str()? != PARTIAL_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.strip_prefix(PARTIAL_PREFIX)?.parse().ok()
}

/// Run `op`, retrying up to `retries` extra times while it fails with an
/// I/O error.
pub(crate) fn retry_io<T>(retries: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, retries, error = %e, "retrying after I/O failure");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn partial(chunk_id: usize, pairs: &[(&str, &str)]) -> PartialIndex {
        let mut p = PartialIndex::new(chunk_id);
        for (token, doc) in pairs {
            p.insert(token.to_string(), doc);
        }
        p
    }

    #[test]
    fn put_list_get() {
        let dir = tempdir().unwrap();
        let store = IntermediateStore::new(dir.path().join("intermediate"));
        store.reset().unwrap();

        let p1 = partial(1, &[("room", "t3")]);
        let p0 = partial(0, &[("the", "t1"), ("matrix", "t1"), ("matrix", "t2")]);
        store.put(&p1).unwrap();
        store.put(&p0).unwrap();

        let staged = store.list().unwrap();
        assert_eq!(staged.iter().map(|s| s.chunk_id).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(store.get(&staged[0]).unwrap(), p0);
        assert_eq!(store.get(&staged[1]).unwrap(), p1);
    }

    #[test]
    fn reset_is_idempotent_and_keeps_foreign_files() {
        let dir = tempdir().unwrap();
        let store = IntermediateStore::new(dir.path());
        store.reset().unwrap();
        store.put(&partial(0, &[("a", "x")])).unwrap();
        fs::write(dir.path().join("partial-00000009.tmp"), b"half").unwrap();
        fs::write(dir.path().join("notes.txt"), b"mine").unwrap();

        store.reset().unwrap();
        store.reset().unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(!dir.path().join("partial-00000009.tmp").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn list_ignores_unfinished_writes() {
        let dir = tempdir().unwrap();
        let store = IntermediateStore::new(dir.path());
        store.reset().unwrap();
        fs::write(dir.path().join("partial-00000002.tmp"), b"half").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_partial_is_a_decode_error() {
        let dir = tempdir().unwrap();
        let store = IntermediateStore::new(dir.path());
        store.reset().unwrap();
        let staged = store.put(&partial(5, &[("the", "t1")])).unwrap();
        fs::write(&staged.path, b"\x01\x02").unwrap();
        assert!(matches!(store.get(&staged), Err(IndexError::Decode { .. })));
    }

    #[test]
    fn misnamed_partial_is_a_decode_error() {
        let dir = tempdir().unwrap();
        let store = IntermediateStore::new(dir.path());
        store.reset().unwrap();
        let staged = store.put(&partial(5, &[("the", "t1")])).unwrap();
        let moved = StagedPartial { chunk_id: 6, path: dir.path().join("partial-00000006.bin") };
        fs::rename(&staged.path, &moved.path).unwrap();
        assert!(matches!(store.get(&moved), Err(IndexError::Decode { .. })));
    }

    #[test]
    fn retry_io_retries_only_io_errors() {
        let mut calls = 0;
        let out = retry_io(2, || {
            calls += 1;
            if calls < 3 {
                Err(IndexError::io(Stage::Stage, "x", io::Error::other("flaky")))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out.unwrap(), 3);

        let mut calls = 0;
        let out: Result<()> = retry_io(5, || {
            calls += 1;
            Err(IndexError::decode("x", "bad bytes"))
        });
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }
}
