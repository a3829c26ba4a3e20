//! Chunked map-reduce construction of a title token index.
//!
//! A delimited corpus is read line by line and cut into bounded chunks
//! ([`chunk`]). Each chunk is turned into a partial index on a worker pool
//! and staged to disk ([`map`], [`store`]). Staged partials are then merged
//! in parallel into a [`aggregate::TokenMultimap`] ([`merge`]) and the result
//! is written as an NDJSON snapshot ([`snapshot`]). [`pipeline::Pipeline`]
//! ties the phases together.

pub mod aggregate;
pub mod chunk;
pub mod corpus;
pub mod error;
pub mod index;
pub mod map;
pub mod merge;
pub mod pipeline;
pub mod snapshot;
pub mod store;
pub mod tokenizer;

pub use error::{IndexError, Result, Stage};
pub use index::{DocId, DocSet, PartialIndex, SortedIndex};
pub use pipeline::{CancelToken, CorruptPolicy, Pipeline, PipelineConfig, RunReport};
