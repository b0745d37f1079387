//! Docflow ingestion
//!
//! Builds the searchable corpus for a repository: token chunking, the
//! content-addressed chunk store, Merkle sync and the indexing pipeline.

pub mod chunk_store;
pub mod chunker;
pub mod errors;
pub mod merkle;
pub mod orchestrator;
pub mod sources;

pub use chunk_store::{ContentAddressedChunkStore, EnsuredChunk};
pub use chunker::{locate_chunks, LineSpan, TokenChunker, TokenWindow};
pub use errors::IngestionError;
pub use merkle::{root_hash, MerkleSynchronizer};
pub use orchestrator::{IndexOutcome, IndexRequest, IndexStage, IndexingOrchestrator};
pub use sources::{GitFetcher, SourceFetcher};
