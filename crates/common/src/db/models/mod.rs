//! SeaORM entity models
//!
//! Database entities for Docflow

pub mod chunk;
mod file;
mod file_chunk;
mod job;
mod merkle_node;
mod repo;
mod review_decision;
mod suggestion;

pub use repo::{
    Entity as RepoEntity,
    Model as Repo,
    ActiveModel as RepoActiveModel,
    Column as RepoColumn,
};

pub use file::{
    Entity as FileEntity,
    Model as FileRecord,
    ActiveModel as FileActiveModel,
    Column as FileColumn,
};

pub use chunk::{
    Entity as ChunkEntity,
    Model as Chunk,
    ActiveModel as ChunkActiveModel,
    Column as ChunkColumn,
};

pub use file_chunk::{
    Entity as FileChunkEntity,
    Model as FileChunkLink,
    ActiveModel as FileChunkActiveModel,
    Column as FileChunkColumn,
};

pub use merkle_node::{
    Entity as MerkleNodeEntity,
    Model as MerkleNode,
    ActiveModel as MerkleNodeActiveModel,
    Column as MerkleNodeColumn,
};

pub use suggestion::{
    Entity as SuggestionEntity,
    Model as Suggestion,
    ActiveModel as SuggestionActiveModel,
    Column as SuggestionColumn,
    ReviewStatus,
};

pub use review_decision::{
    Entity as ReviewDecisionEntity,
    Model as ReviewDecision,
    ActiveModel as ReviewDecisionActiveModel,
    Column as ReviewDecisionColumn,
};

pub use job::{
    Entity as JobEntity,
    Model as Job,
    ActiveModel as JobActiveModel,
    Column as JobColumn,
    JobStatus,
};
