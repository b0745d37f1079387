//! Docflow search
//!
//! Similarity retrieval over content-addressed chunks, with full-text and
//! keyword fallbacks, and the elbow analyzer that decides how many ranked
//! candidates are relevant.

pub mod elbow;
pub mod retrieval;

pub use elbow::{CutoffMethod, ElbowAnalyzer, ElbowDetector, ElbowDiagnostics, ElbowRetrieval};
pub use retrieval::{extract_keywords, RetrievalMode, SearchRequest, SearchResponse, SimilarityRetriever};

#[cfg(test)]
pub(crate) mod testing {
    use docflow_common::db::models::FileChunkLink;
    use docflow_common::db::{MemoryRecordStore, NewChunk, NewFile, RecordStore};
    use docflow_common::sha256_hex;
    use uuid::Uuid;

    /// Link one chunk with `embedding` into `path`
    pub async fn seed_chunk(
        records: &MemoryRecordStore,
        repo_id: Uuid,
        path: &str,
        order: i32,
        content: &str,
        embedding: Vec<f32>,
    ) {
        let file = records
            .upsert_file(NewFile {
                repo_id,
                path: path.to_string(),
                content_hash: sha256_hex(path),
                storage_key: format!("{}/{}", repo_id, path),
            })
            .await
            .unwrap();

        let hash = sha256_hex(content);
        records
            .insert_chunk_if_absent(NewChunk {
                hash: hash.clone(),
                content: content.to_string(),
                embedding,
                token_count: content.split_whitespace().count() as i32,
            })
            .await
            .unwrap();

        records
            .upsert_file_chunk(FileChunkLink {
                file_id: file.id,
                chunk_order: order,
                chunk_hash: hash,
                start_line: 1,
                end_line: 1,
            })
            .await
            .unwrap();
    }
}
