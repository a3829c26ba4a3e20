use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub type DocId = String;
pub type DocSet = HashSet<DocId>;

/// Token to document ids for a single chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialIndex {
    pub chunk_id: usize,
    pub postings: HashMap<String, DocSet>,
}

impl PartialIndex {
    pub fn new(chunk_id: usize) -> Self {
        Self { chunk_id, postings: HashMap::new() }
    }

    pub fn insert(&mut self, token: String, doc_id: &str) {
        let docs = self.postings.entry(token).or_default();
        if !docs.contains(doc_id) {
            docs.insert(doc_id.to_owned());
        }
    }

    pub fn token_count(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }
}

/// Ordered token to ordered document ids; the comparable form of any index.
pub type SortedIndex = BTreeMap<String, BTreeSet<DocId>>;

pub fn to_sorted<I, S>(entries: I) -> SortedIndex
where
    I: IntoIterator<Item = (String, S)>,
    S: IntoIterator<Item = DocId>,
{
    entries.into_iter().map(|(token, docs)| (token, docs.into_iter().collect())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_deduplicates_documents() {
        let mut p = PartialIndex::new(4);
        p.insert("the".into(), "tt1");
        p.insert("the".into(), "tt1");
        p.insert("the".into(), "tt2");
        assert_eq!(p.token_count(), 1);
        assert_eq!(p.postings["the"].len(), 2);
    }
}
