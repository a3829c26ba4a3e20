use crate::aggregate::TokenMultimap;
use crate::error::Result;
use crate::index::PartialIndex;
use crate::store::{retry_io, IntermediateStore, StagedPartial};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub chunk_id: usize,
    pub tokens: usize,
    /// Document ids this partial added that no earlier merge had.
    pub new_postings: usize,
}

/// Fold one partial index into the aggregate.
pub fn merge_partial(partial: PartialIndex, aggregate: &TokenMultimap) -> MergeStats {
    let mut stats = MergeStats { chunk_id: partial.chunk_id, tokens: partial.token_count(), new_postings: 0 };
    for (token, docs) in partial.postings {
        stats.new_postings += aggregate.union(&token, docs);
    }
    stats
}

/// Load a staged partial and fold it into the aggregate.
pub fn merge_staged(
    store: &IntermediateStore,
    staged: &StagedPartial,
    aggregate: &TokenMultimap,
    io_retries: u32,
) -> Result<MergeStats> {
    let start = Instant::now();
    let partial = retry_io(io_retries, || store.get(staged))?;
    let stats = merge_partial(partial, aggregate);
    tracing::debug!(
        chunk_id = stats.chunk_id,
        tokens = stats.tokens,
        new_postings = stats.new_postings,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "merged partial"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(chunk_id: usize, pairs: &[(&str, &str)]) -> PartialIndex {
        let mut p = PartialIndex::new(chunk_id);
        for (token, doc) in pairs {
            p.insert(token.to_string(), doc);
        }
        p
    }

    #[test]
    fn merge_order_does_not_matter() {
        let a = partial(0, &[("the", "t1"), ("matrix", "t1"), ("matrix", "t2"), ("reloaded", "t2")]);
        let b = partial(1, &[("the", "t3"), ("room", "t3")]);

        let forward = TokenMultimap::new();
        merge_partial(a.clone(), &forward);
        merge_partial(b.clone(), &forward);

        let backward = TokenMultimap::new();
        let sb = merge_partial(b, &backward);
        let sa = merge_partial(a, &backward);

        assert_eq!(forward.to_sorted(), backward.to_sorted());
        assert_eq!(sb.new_postings + sa.new_postings, 6);
    }

    #[test]
    fn overlapping_partials_count_new_ids_once() {
        let agg = TokenMultimap::new();
        let first = merge_partial(partial(0, &[("the", "t1")]), &agg);
        let again = merge_partial(partial(1, &[("the", "t1"), ("the", "t2")]), &agg);
        assert_eq!((first.new_postings, again.new_postings), (1, 1));
    }
}
