use crate::chunk::Chunk;
use crate::corpus::{CorpusSchema, RawRecord};
use crate::error::Result;
use crate::index::PartialIndex;
use crate::store::{retry_io, IntermediateStore};
use crate::tokenizer::tokenize;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MapStats {
    pub chunk_id: usize,
    pub records: usize,
    pub skipped: usize,
    pub tokens: usize,
}

/// Build the partial index of one chunk. Rows with too few fields are
/// skipped and counted; nothing else can fail here.
pub fn index_chunk(chunk: &Chunk<RawRecord>, schema: &CorpusSchema) -> (PartialIndex, MapStats) {
    let mut partial = PartialIndex::new(chunk.id);
    let mut skipped = 0;
    for raw in &chunk.records {
        let record = match schema.parse(raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(chunk_id = chunk.id, error = %e, "skipping malformed record");
                skipped += 1;
                continue;
            }
        };
        for token in tokenize(record.text) {
            partial.insert(token, record.id);
        }
    }
    let stats = MapStats {
        chunk_id: chunk.id,
        records: chunk.records.len(),
        skipped,
        tokens: partial.token_count(),
    };
    (partial, stats)
}

/// Map one chunk and stage its partial index.
pub fn map_chunk(
    chunk: Chunk<RawRecord>,
    schema: &CorpusSchema,
    store: &IntermediateStore,
    io_retries: u32,
) -> Result<MapStats> {
    let start = Instant::now();
    let (partial, stats) = index_chunk(&chunk, schema);
    drop(chunk);
    retry_io(io_retries, || store.put(&partial))?;
    tracing::info!(
        chunk_id = stats.chunk_id,
        records = stats.records,
        skipped = stats.skipped,
        tokens = stats.tokens,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "mapped chunk"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: usize, lines: &[&str]) -> Chunk<RawRecord> {
        let records = lines
            .iter()
            .enumerate()
            .map(|(i, text)| RawRecord { line: i as u64 + 2, text: text.to_string() })
            .collect();
        Chunk { id, records }
    }

    #[test]
    fn repeated_token_in_title_yields_one_doc() {
        let schema = CorpusSchema::default();
        let c = chunk(0, &["tt9\tmovie\tNew York, New York\tx"]);
        let (partial, stats) = index_chunk(&c, &schema);
        assert_eq!(partial.postings["new"].len(), 1);
        assert_eq!(stats.tokens, 3);
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let schema = CorpusSchema::default();
        let c = chunk(3, &["tt1\tmovie\tThe Matrix\tx", "garbage", "tt2\tmovie", "tt3\tshort\tThe Room\tx"]);
        let (partial, stats) = index_chunk(&c, &schema);
        assert_eq!(stats, MapStats { chunk_id: 3, records: 4, skipped: 2, tokens: 3 });
        let mut the: Vec<&String> = partial.postings["the"].iter().collect();
        the.sort();
        assert_eq!(the, vec!["tt1", "tt3"]);
    }
}
