//! Document sources
//!
//! Hard re-indexing clones the repository into an ephemeral workspace and
//! walks the documentation directory on disk. Soft re-indexing reads back
//! the content stored by a previous run.

use anyhow::{bail, Context};
use async_trait::async_trait;
use docflow_common::db::models::FileRecord;
use docflow_common::queue::RepoSource;
use docflow_common::storage::{decode_utf8_lossy, ContentStore};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::errors::IngestionError;

/// A documentation file read from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDocument {
    /// Path relative to the documentation root, `/`-separated
    pub path: String,
    pub content: String,
}

/// Version-control fetch
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Clone `source` under `dest` and return the checkout path
    async fn fetch(
        &self,
        source: &RepoSource,
        docs_directory: &str,
        dest: &Path,
    ) -> Result<PathBuf, IngestionError>;

    /// Revision identifier of a checkout
    async fn current_revision(&self, checkout: &Path) -> Result<String, IngestionError>;
}

/// Fetches over HTTPS with the `git` CLI: shallow, single-branch and sparse
#[derive(Debug, Clone)]
pub struct GitFetcher {
    host: String,
}

impl GitFetcher {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn clone_url(&self, source: &RepoSource) -> String {
        match &source.access_token {
            Some(token) => format!("https://{}@{}/{}.git", token, self.host, source.full_name),
            None => format!("https://{}/{}.git", self.host, source.full_name),
        }
    }
}

/// Replace a credential in git output before it reaches logs or errors
fn redact(text: &str, source: &RepoSource) -> String {
    match &source.access_token {
        Some(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
        _ => text.to_string(),
    }
}

async fn run_git(args: &[&str], cwd: Option<&Path>) -> anyhow::Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args[0]))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args[0], stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        source: &RepoSource,
        docs_directory: &str,
        dest: &Path,
    ) -> Result<PathBuf, IngestionError> {
        let checkout = dest.join("repo");
        let url = self.clone_url(source);
        let checkout_str = checkout.to_string_lossy().to_string();

        info!(repo = %source.full_name, branch = %source.branch, "Cloning repository");

        let result = async {
            run_git(
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    &source.branch,
                    "--single-branch",
                    "--filter=blob:none",
                    "--sparse",
                    &url,
                    &checkout_str,
                ],
                None,
            )
            .await?;

            let docs = docs_directory.trim_matches('/');
            if !docs.is_empty() {
                run_git(&["sparse-checkout", "set", docs], Some(&checkout)).await?;
            }
            anyhow::Ok(())
        }
        .await;

        result.map_err(|e| IngestionError::Clone {
            repo: source.full_name.clone(),
            message: redact(&format!("{:#}", e), source),
        })?;

        info!(path = %checkout.display(), "Repository cloned");
        Ok(checkout)
    }

    async fn current_revision(&self, checkout: &Path) -> Result<String, IngestionError> {
        run_git(&["rev-parse", "HEAD"], Some(checkout))
            .await
            .map_err(|e| IngestionError::Clone {
                repo: checkout.display().to_string(),
                message: format!("{:#}", e),
            })
    }
}

fn has_allowed_extension(path: &Path, allowed: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    allowed
        .iter()
        .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

/// Whether the first `sniff_bytes` of a file contain a null byte
fn is_binary(path: &Path, sniff_bytes: usize) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return true;
    };
    let mut head = Vec::with_capacity(sniff_bytes);
    match file.take(sniff_bytes as u64).read_to_end(&mut head) {
        Ok(_) => head.contains(&0),
        Err(_) => true,
    }
}

/// Walk `docs_root` and read every documentation file.
///
/// Files outside the extension allow-list, binary files and files that are
/// not valid UTF-8 are skipped. A missing root yields no documents.
pub fn collect_documents(
    docs_root: &Path,
    allowed_extensions: &[String],
    sniff_bytes: usize,
) -> Result<Vec<DiskDocument>, IngestionError> {
    if !docs_root.exists() {
        warn!(path = %docs_root.display(), "Documentation directory does not exist");
        return Ok(Vec::new());
    }

    let mut documents = Vec::new();

    for entry in WalkDir::new(docs_root).follow_links(false) {
        let entry = entry.map_err(|e| IngestionError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !has_allowed_extension(path, allowed_extensions) {
            continue;
        }

        let relative = path.strip_prefix(docs_root).unwrap_or(path);
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if is_binary(path, sniff_bytes) {
            info!(path = %relative, "Skipping binary file");
            continue;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => documents.push(DiskDocument {
                path: relative,
                content,
            }),
            Err(e) => warn!(path = %relative, error = %e, "Skipping unreadable file"),
        }
    }

    documents.sort_by(|a, b| a.path.cmp(&b.path));
    info!(count = documents.len(), "Collected documentation files");
    Ok(documents)
}

/// Object key of a stored file within `bucket`.
///
/// Older records carry the bucket name as a key prefix.
pub fn key_in_bucket<'a>(storage_key: &'a str, bucket: &str) -> &'a str {
    storage_key
        .strip_prefix(bucket)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(storage_key)
}

/// Read back the stored content of previously indexed files.
///
/// Files whose object is missing or unreadable are skipped with a warning.
pub async fn read_stored_documents(
    store: &dyn ContentStore,
    bucket: &str,
    files: &[FileRecord],
) -> Vec<DiskDocument> {
    let mut documents = Vec::with_capacity(files.len());

    for file in files {
        let key = key_in_bucket(&file.storage_key, bucket);
        match store.get(bucket, key).await {
            Ok(Some(bytes)) => documents.push(DiskDocument {
                path: file.path.clone(),
                content: decode_utf8_lossy(&bytes),
            }),
            Ok(None) => warn!(path = %file.path, key, "Stored content missing, skipping file"),
            Err(e) => warn!(path = %file.path, key, error = %e, "Failed to read stored content, skipping file"),
        }
    }

    documents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec![".md".to_string(), ".mdx".to_string()]
    }

    #[test]
    fn test_collect_documents_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("guide")).unwrap();
        std::fs::write(root.join("index.md"), "# Home\n").unwrap();
        std::fs::write(root.join("guide/setup.MDX"), "Setup steps\n").unwrap();
        std::fs::write(root.join("logo.png"), [0x89, 0x50, 0x4e, 0x47]).unwrap();
        std::fs::write(root.join("notes.txt"), "not docs").unwrap();
        std::fs::write(root.join("blob.md"), b"abc\0def").unwrap();
        std::fs::write(root.join("latin1.md"), [0x63, 0x61, 0x66, 0xe9]).unwrap();

        let docs = collect_documents(root, &allowed(), 1024).unwrap();
        let paths: Vec<&str> = docs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["guide/setup.MDX", "index.md"]);
        assert_eq!(docs[1].content, "# Home\n");
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let docs = collect_documents(&dir.path().join("nope"), &allowed(), 1024).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_key_in_bucket() {
        assert_eq!(key_in_bucket("docs/abc/index.md", "docs"), "abc/index.md");
        assert_eq!(key_in_bucket("abc/index.md", "docs"), "abc/index.md");
        assert_eq!(key_in_bucket("docsets/x.md", "docs"), "docsets/x.md");
    }

    #[tokio::test]
    async fn test_read_stored_documents_skips_missing() {
        use docflow_common::storage::MemoryContentStore;

        let store = MemoryContentStore::new();
        store.put("docs", "r/a.md", b"alpha".to_vec()).await.unwrap();

        let record = |path: &str, key: &str| FileRecord {
            id: uuid::Uuid::new_v4(),
            repo_id: uuid::Uuid::nil(),
            path: path.to_string(),
            content_hash: String::new(),
            storage_key: key.to_string(),
            has_uncommitted_changes: false,
            created_at: chrono::Utc::now().into(),
            updated_at: chrono::Utc::now().into(),
        };
        let files = vec![record("a.md", "docs/r/a.md"), record("b.md", "r/b.md")];

        let docs = read_stored_documents(&store, "docs", &files).await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "a.md");
        assert_eq!(docs[0].content, "alpha");
    }

    #[test]
    fn test_clone_url_and_redaction() {
        let fetcher = GitFetcher::new("github.com");
        let source = RepoSource {
            full_name: "acme/docs".to_string(),
            branch: "main".to_string(),
            access_token: Some("s3cret".to_string()),
        };
        let url = fetcher.clone_url(&source);
        assert_eq!(url, "https://s3cret@github.com/acme/docs.git");
        assert_eq!(redact(&format!("fatal: {}", url), &source), "fatal: https://***@github.com/acme/docs.git");

        let public = RepoSource {
            access_token: None,
            ..source
        };
        assert_eq!(fetcher.clone_url(&public), "https://github.com/acme/docs.git");
    }
}
