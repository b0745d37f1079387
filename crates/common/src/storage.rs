//! Content (blob) store
//!
//! Document content lives in a bucketed key/value store. The HTTP client
//! speaks the Supabase storage REST dialect; the in-memory store backs tests
//! and local runs.

use crate::config::StorageConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key/bytes store with implicit overwrite
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Write an object, replacing any existing one
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Read an object; `None` when it does not exist
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete an object
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// List object keys under a prefix
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Object key for a repository file
pub fn object_key(repo_id: impl std::fmt::Display, path: &str) -> String {
    format!("{}/{}", repo_id, path.trim_start_matches('/'))
}

/// Decode stored bytes as UTF-8, replacing invalid sequences
pub fn decode_utf8_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Content type used when uploading a document
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("md") => "text/markdown",
        Some("mdx") => "text/mdx",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        _ => "application/octet-stream",
    }
}

/// Supabase storage client
pub struct HttpContentStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: u32,
    offset: u32,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    prefixes: [&'a str; 1],
}

const LIST_PAGE: u32 = 1000;

impl HttpContentStore {
    pub fn new(base_url: String, api_key: String, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries,
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, key)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("apikey", &self.api_key)
    }

    async fn download_once(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .authorized(self.client.get(self.object_url(bucket, key)))
            .send()
            .await
            .map_err(|e| AppError::Store {
                message: format!("Download of {}/{} failed: {}", bucket, key, e),
            })?;

        let status = response.status();
        // The storage API reports missing objects as 400 or 404
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AppError::Store {
                message: format!("Download of {}/{} returned {}", bucket, key, status),
            });
        }

        let bytes = response.bytes().await.map_err(|e| AppError::Store {
            message: format!("Reading {}/{} failed: {}", bucket, key, e),
        })?;
        Ok(Some(bytes.to_vec()))
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        debug!(bucket, key, size = bytes.len(), "Uploading object");

        // Overwrite is delete-then-upload; a missing object is not an error here
        if let Err(e) = self.delete(bucket, key).await {
            debug!(bucket, key, error = %e, "Pre-upload delete failed");
        }

        let response = self
            .authorized(self.client.post(self.object_url(bucket, key)))
            .header("Content-Type", content_type_for(key))
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| AppError::Store {
                message: format!("Upload of {}/{} failed: {}", bucket, key, e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Store {
                message: format!("Upload of {}/{} returned {}: {}", bucket, key, status, body),
            });
        }

        info!(bucket, key, "Uploaded object");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match self.download_once(bucket, key).await {
                Ok(found) => return Ok(found),
                Err(e) => {
                    if attempt < self.max_retries {
                        let wait = Duration::from_millis(500 * 2u64.pow(attempt));
                        warn!(bucket, key, attempt = attempt + 1, error = %e, "Download failed, retrying");
                        tokio::time::sleep(wait).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::Store {
            message: format!("Download of {}/{} failed", bucket, key),
        }))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let url = format!("{}/storage/v1/object/{}", self.base_url, bucket);
        let response = self
            .authorized(self.client.delete(url))
            .json(&DeleteRequest { prefixes: [key] })
            .send()
            .await
            .map_err(|e| AppError::Store {
                message: format!("Delete of {}/{} failed: {}", bucket, key, e),
            })?;

        if !response.status().is_success() {
            return Err(AppError::Store {
                message: format!("Delete of {}/{} returned {}", bucket, key, response.status()),
            });
        }
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/storage/v1/object/list/{}", self.base_url, bucket);
        let mut keys = Vec::new();
        let mut offset = 0;

        loop {
            let response = self
                .authorized(self.client.post(&url))
                .json(&ListRequest {
                    prefix,
                    limit: LIST_PAGE,
                    offset,
                })
                .send()
                .await
                .map_err(|e| AppError::Store {
                    message: format!("Listing {}/{} failed: {}", bucket, prefix, e),
                })?;

            if !response.status().is_success() {
                return Err(AppError::Store {
                    message: format!("Listing {}/{} returned {}", bucket, prefix, response.status()),
                });
            }

            let entries: Vec<ListEntry> = response.json().await.map_err(|e| AppError::Store {
                message: format!("Listing {}/{} returned invalid JSON: {}", bucket, prefix, e),
            })?;
            let page_len = entries.len() as u32;

            // Folder placeholders carry no id
            keys.extend(
                entries
                    .into_iter()
                    .filter(|e| e.id.is_some())
                    .map(|e| format!("{}/{}", prefix.trim_end_matches('/'), e.name)),
            );

            if page_len < LIST_PAGE {
                break;
            }
            offset += page_len;
        }

        Ok(keys)
    }
}

/// In-memory content store
#[derive(Default)]
pub struct MemoryContentStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a store error, simulating an outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError::Store {
                message: "content store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn poisoned(_: impl std::fmt::Display) -> AppError {
    AppError::Store {
        message: "content store lock poisoned".to_string(),
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.check_available()?;
        self.objects
            .write()
            .map_err(poisoned)?
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .map_err(poisoned)?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects
            .write()
            .map_err(poisoned)?
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .map_err(poisoned)?
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }
}

/// Create a content store based on configuration
pub fn create_content_store(config: &StorageConfig) -> Result<Arc<dyn ContentStore>> {
    match config.provider.as_str() {
        "supabase" => {
            let url = config.url.clone().ok_or_else(|| AppError::Configuration {
                message: "storage.url is required for the supabase provider".to_string(),
            })?;
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "storage.api_key is required for the supabase provider".to_string(),
            })?;
            Ok(Arc::new(HttpContentStore::new(
                url,
                key,
                Duration::from_secs(config.timeout_secs),
                config.max_retries,
            )?))
        }
        "memory" => Ok(Arc::new(MemoryContentStore::new())),
        other => Err(AppError::Configuration {
            message: format!("Unknown storage provider: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_put_overwrites() {
        let store = MemoryContentStore::new();
        store.put("docs", "r/a.md", b"one".to_vec()).await.unwrap();
        store.put("docs", "r/a.md", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get("docs", "r/a.md").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_list_and_delete() {
        let store = MemoryContentStore::new();
        store.put("docs", "r1/a.md", vec![]).await.unwrap();
        store.put("docs", "r1/b.md", vec![]).await.unwrap();
        store.put("docs", "r2/c.md", vec![]).await.unwrap();
        store.put("other", "r1/d.md", vec![]).await.unwrap();

        assert_eq!(store.list("docs", "r1/").await.unwrap(), vec!["r1/a.md", "r1/b.md"]);

        store.delete("docs", "r1/a.md").await.unwrap();
        assert!(store.get("docs", "r1/a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_unavailable() {
        let store = MemoryContentStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("docs", "x").await,
            Err(AppError::Store { .. })
        ));
    }

    #[test]
    fn test_object_key_and_content_type() {
        assert_eq!(object_key("repo", "/docs/a.md"), "repo/docs/a.md");
        assert_eq!(content_type_for("docs/a.MD"), "text/markdown");
        assert_eq!(content_type_for("docs/a.mdx"), "text/mdx");
        assert_eq!(content_type_for("docs/LICENSE"), "application/octet-stream");
    }

    #[test]
    fn test_lossy_decode() {
        assert_eq!(decode_utf8_lossy(&[b'o', b'k', 0xff]), "ok\u{fffd}");
    }
}
