//! Merkle synchronizer
//!
//! A flat, single-level fingerprint of a repository snapshot: the root hash
//! is sha256 over the path-sorted concatenation of `path:content_hash`.

use docflow_common::db::{NewMerkleNode, RecordStore};
use docflow_common::errors::Result;
use docflow_common::sha256_hex;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// (path, content hash) of one file in a snapshot
pub type FileHash = (String, String);

/// Deterministic root hash over a snapshot, independent of input order
pub fn root_hash(files: &[FileHash]) -> String {
    let mut sorted: Vec<&FileHash> = files.iter().collect();
    sorted.sort();

    let combined: String = sorted
        .iter()
        .map(|(path, hash)| format!("{}:{}", path, hash))
        .collect();

    debug!(combined_len = combined.len(), "Computed Merkle input");
    sha256_hex(&combined)
}

/// Directory portion of a path, `None` at the top level
pub fn parent_path(path: &str) -> Option<String> {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent.to_string()),
        _ => None,
    }
}

/// Persists Merkle nodes and compares snapshots against the stored root
#[derive(Clone)]
pub struct MerkleSynchronizer {
    records: Arc<dyn RecordStore>,
}

impl MerkleSynchronizer {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Upsert one node per file, keyed by (repo_id, path)
    pub async fn store_nodes(&self, repo_id: Uuid, files: &[FileHash]) -> Result<()> {
        info!(repo_id = %repo_id, count = files.len(), "Storing Merkle nodes");

        let mut sorted: Vec<&FileHash> = files.iter().collect();
        sorted.sort();

        for (path, hash) in sorted {
            self.records
                .upsert_merkle_node(NewMerkleNode {
                    repo_id,
                    path: path.clone(),
                    hash: hash.clone(),
                    parent_path: parent_path(path),
                })
                .await?;
        }
        Ok(())
    }

    /// Whether `files` hashes to the repository's stored root.
    ///
    /// A repository that was never synced compares as changed.
    pub async fn compare(&self, repo_id: Uuid, files: &[FileHash]) -> Result<bool> {
        let stored = self
            .records
            .find_repo(repo_id)
            .await?
            .and_then(|repo| repo.root_hash);

        Ok(match stored {
            Some(stored) => stored == root_hash(files),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_common::db::MemoryRecordStore;

    fn snapshot() -> Vec<FileHash> {
        vec![
            ("guide/setup.md".to_string(), sha256_hex("setup")),
            ("index.md".to_string(), sha256_hex("index")),
            ("api.mdx".to_string(), sha256_hex("api")),
        ]
    }

    #[test]
    fn test_root_hash_is_order_independent() {
        let files = snapshot();
        let mut reversed = files.clone();
        reversed.reverse();
        assert_eq!(root_hash(&files), root_hash(&reversed));
    }

    #[test]
    fn test_root_hash_is_sensitive_to_changes() {
        let files = snapshot();
        let base = root_hash(&files);

        let mut edited = files.clone();
        edited[1].1 = sha256_hex("index!");
        assert_ne!(root_hash(&edited), base);

        let mut added = files.clone();
        added.push(("new.md".to_string(), sha256_hex("new")));
        assert_ne!(root_hash(&added), base);

        let removed = files[..2].to_vec();
        assert_ne!(root_hash(&removed), base);
    }

    #[test]
    fn test_root_hash_concatenation() {
        let files = vec![
            ("b.md".to_string(), "2".to_string()),
            ("a.md".to_string(), "1".to_string()),
        ];
        assert_eq!(root_hash(&files), sha256_hex("a.md:1b.md:2"));
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("guide/setup.md").as_deref(), Some("guide"));
        assert_eq!(parent_path("a/b/c.md").as_deref(), Some("a/b"));
        assert_eq!(parent_path("index.md"), None);
    }

    #[tokio::test]
    async fn test_compare_against_stored_root() {
        let records = Arc::new(MemoryRecordStore::new());
        let repo = records.insert_repo("acme/docs", "main", "docs").unwrap();
        let sync = MerkleSynchronizer::new(records.clone());
        let files = snapshot();

        // Never synced
        assert!(!sync.compare(repo.id, &files).await.unwrap());

        records
            .update_repo_sync(repo.id, &root_hash(&files), None)
            .await
            .unwrap();
        assert!(sync.compare(repo.id, &files).await.unwrap());
        assert!(!sync.compare(repo.id, &files[..1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_nodes_upserts_by_path() {
        let records = Arc::new(MemoryRecordStore::new());
        let repo = records.insert_repo("acme/docs", "main", "docs").unwrap();
        let sync = MerkleSynchronizer::new(records.clone());

        sync.store_nodes(repo.id, &snapshot()).await.unwrap();
        sync.store_nodes(repo.id, &snapshot()).await.unwrap();

        let nodes = records.merkle_nodes(repo.id);
        assert_eq!(nodes.len(), 3);
        let setup = nodes.iter().find(|n| n.path == "guide/setup.md").unwrap();
        assert_eq!(setup.parent_path.as_deref(), Some("guide"));
        assert_eq!(setup.node_type, "file");

        // File nodes only, no node for the "guide" directory
        assert!(nodes.iter().all(|n| n.node_type == "file"));
        assert!(!nodes.iter().any(|n| n.path == "guide"));
    }
}
