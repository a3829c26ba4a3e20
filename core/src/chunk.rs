use crate::error::{IndexError, Result};

/// A bounded run of consecutive records. Ids start at 0 in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T> {
    pub id: usize,
    pub records: Vec<T>,
}

/// Groups a fallible record stream into chunks of at most `size` records.
///
/// The first read error is yielded in place of a chunk and ends the stream;
/// records buffered for the unfinished chunk are dropped with it.
pub struct Chunks<I> {
    inner: I,
    size: usize,
    next_id: usize,
    max_chunks: Option<usize>,
    done: bool,
}

pub fn chunks<I, T>(records: I, size: usize) -> Result<Chunks<I::IntoIter>>
where
    I: IntoIterator<Item = Result<T>>,
{
    if size == 0 {
        return Err(IndexError::config("chunk size must be positive"));
    }
    Ok(Chunks { inner: records.into_iter(), size, next_id: 0, max_chunks: None, done: false })
}

impl<I> Chunks<I> {
    /// Stop after `max` chunks; the rest of the input is never read.
    pub fn with_limit(mut self, max: Option<usize>) -> Self {
        self.max_chunks = max;
        self
    }
}

impl<I, T> Iterator for Chunks<I>
where
    I: Iterator<Item = Result<T>>,
{
    type Item = Result<Chunk<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.max_chunks.is_some_and(|max| self.next_id >= max) {
            return None;
        }
        let mut records = Vec::with_capacity(self.size.min(4096));
        while records.len() < self.size {
            match self.inner.next() {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if records.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(Ok(Chunk { id, records }))
    }
}
