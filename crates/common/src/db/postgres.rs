//! Postgres record store
//!
//! Entity CRUD goes through SeaORM; anything touching the pgvector column or
//! needing `ON CONFLICT` semantics is raw parametrized SQL.

use crate::db::models::chunk::format_embedding;
use crate::db::models::*;
use crate::db::store::{
    ChunkMatch, JobUpdate, NewChunk, NewFile, NewMerkleNode, NewSuggestion, RecordStore, VectorQuery,
};
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QueryResult, Set, Statement, TransactionTrait,
};
use uuid::Uuid;

/// Record store backed by Postgres with pgvector
#[derive(Clone)]
pub struct PgRecordStore {
    pool: DbPool,
}

impl PgRecordStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    async fn query_matches(&self, sql: &str, values: Vec<sea_orm::Value>) -> Result<Vec<ChunkMatch>> {
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);
        let rows = self.read_conn().query_all(stmt).await?;
        rows.iter()
            .map(chunk_match_from_row)
            .collect::<std::result::Result<Vec<_>, DbErr>>()
            .map_err(Into::into)
    }
}

/// Shared projection for every chunk search
const MATCH_COLUMNS: &str = r#"
    c.hash AS chunk_hash,
    c.content AS content,
    f.path AS file_path,
    fc.chunk_order AS chunk_order,
    fc.start_line AS start_line,
    fc.end_line AS end_line
"#;

fn chunk_match_from_row(row: &QueryResult) -> std::result::Result<ChunkMatch, DbErr> {
    Ok(ChunkMatch {
        chunk_hash: row.try_get("", "chunk_hash")?,
        content: row.try_get("", "content")?,
        similarity: row.try_get("", "similarity")?,
        file_path: row.try_get("", "file_path")?,
        chunk_order: row.try_get("", "chunk_order")?,
        start_line: row.try_get("", "start_line")?,
        end_line: row.try_get("", "end_line")?,
    })
}

/// Escape LIKE metacharacters so keywords match literally
fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    for ch in keyword.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl RecordStore for PgRecordStore {
    // ========================================================================
    // Health Check
    // ========================================================================

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Repo Operations
    // ========================================================================

    async fn find_repo(&self, repo_id: Uuid) -> Result<Option<Repo>> {
        RepoEntity::find_by_id(repo_id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn update_repo_sync(
        &self,
        repo_id: Uuid,
        root_hash: &str,
        last_sync_sha: Option<&str>,
    ) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE repos
            SET root_hash = $1,
                last_sync_sha = COALESCE($2, last_sync_sha),
                last_synced_at = NOW()
            WHERE id = $3
            "#,
            vec![
                root_hash.into(),
                last_sync_sha.map(str::to_string).into(),
                repo_id.into(),
            ],
        );

        let result = self.write_conn().execute(stmt).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("repository", repo_id));
        }
        Ok(())
    }

    // ========================================================================
    // File Operations
    // ========================================================================

    async fn upsert_file(&self, file: NewFile) -> Result<FileRecord> {
        let now = chrono::Utc::now();

        let model = FileActiveModel {
            id: Set(Uuid::new_v4()),
            repo_id: Set(file.repo_id),
            path: Set(file.path.clone()),
            content_hash: Set(file.content_hash),
            storage_key: Set(file.storage_key),
            has_uncommitted_changes: Set(false),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        FileEntity::insert(model)
            .on_conflict(
                OnConflict::columns([FileColumn::RepoId, FileColumn::Path])
                    .update_columns([
                        FileColumn::ContentHash,
                        FileColumn::StorageKey,
                        FileColumn::HasUncommittedChanges,
                        FileColumn::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        FileEntity::find()
            .filter(FileColumn::RepoId.eq(file.repo_id))
            .filter(FileColumn::Path.eq(file.path.as_str()))
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::not_found("file", &file.path))
    }

    async fn update_file_hash(
        &self,
        repo_id: Uuid,
        path: &str,
        content_hash: &str,
    ) -> Result<Option<FileRecord>> {
        let Some(existing) = FileEntity::find()
            .filter(FileColumn::RepoId.eq(repo_id))
            .filter(FileColumn::Path.eq(path))
            .one(self.write_conn())
            .await?
        else {
            return Ok(None);
        };

        let mut file: FileActiveModel = existing.into();
        file.content_hash = Set(content_hash.to_string());
        file.updated_at = Set(chrono::Utc::now().into());

        Ok(Some(file.update(self.write_conn()).await?))
    }

    async fn find_file(&self, repo_id: Uuid, path: &str) -> Result<Option<FileRecord>> {
        FileEntity::find()
            .filter(FileColumn::RepoId.eq(repo_id))
            .filter(FileColumn::Path.eq(path))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn list_files(&self, repo_id: Uuid) -> Result<Vec<FileRecord>> {
        FileEntity::find()
            .filter(FileColumn::RepoId.eq(repo_id))
            .order_by_asc(FileColumn::Path)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Chunk Operations
    // ========================================================================

    async fn chunk_exists(&self, hash: &str) -> Result<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT 1 AS present FROM chunks WHERE hash = $1",
            vec![hash.into()],
        );
        Ok(self.read_conn().query_one(stmt).await?.is_some())
    }

    async fn insert_chunk_if_absent(&self, chunk: NewChunk) -> Result<bool> {
        // Use raw SQL for pgvector type
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            INSERT INTO chunks (hash, content, embedding, token_count, created_at)
            VALUES ($1, $2, $3::vector, $4, NOW())
            ON CONFLICT (hash) DO NOTHING
            "#,
            vec![
                chunk.hash.into(),
                chunk.content.into(),
                format_embedding(&chunk.embedding).into(),
                chunk.token_count.into(),
            ],
        );

        let result = self.write_conn().execute(stmt).await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // File/Chunk Link Operations
    // ========================================================================

    async fn upsert_file_chunk(&self, link: FileChunkLink) -> Result<()> {
        let model = FileChunkActiveModel {
            file_id: Set(link.file_id),
            chunk_order: Set(link.chunk_order),
            chunk_hash: Set(link.chunk_hash),
            start_line: Set(link.start_line),
            end_line: Set(link.end_line),
        };

        FileChunkEntity::insert(model)
            .on_conflict(
                OnConflict::columns([FileChunkColumn::FileId, FileChunkColumn::ChunkOrder])
                    .update_columns([
                        FileChunkColumn::ChunkHash,
                        FileChunkColumn::StartLine,
                        FileChunkColumn::EndLine,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        Ok(())
    }

    async fn prune_file_chunks(&self, file_id: Uuid, keep: i32) -> Result<u64> {
        let result = FileChunkEntity::delete_many()
            .filter(FileChunkColumn::FileId.eq(file_id))
            .filter(FileChunkColumn::ChunkOrder.gte(keep))
            .exec(self.write_conn())
            .await?;
        Ok(result.rows_affected)
    }

    async fn file_chunk_contents(&self, file_id: Uuid) -> Result<Vec<String>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT c.content AS content
            FROM file_chunks fc
            JOIN chunks c ON c.hash = fc.chunk_hash
            WHERE fc.file_id = $1
            ORDER BY fc.chunk_order
            "#,
            vec![file_id.into()],
        );

        let rows = self.read_conn().query_all(stmt).await?;
        rows.iter()
            .map(|row| row.try_get::<String>("", "content"))
            .collect::<std::result::Result<Vec<_>, DbErr>>()
            .map_err(Into::into)
    }

    // ========================================================================
    // Search Operations
    // ========================================================================

    async fn vector_search(&self, query: VectorQuery<'_>) -> Result<Vec<ChunkMatch>> {
        let sql = format!(
            r#"
            SELECT {MATCH_COLUMNS},
                (1 - (c.embedding <=> $1::vector))::float8 AS similarity
            FROM chunks c
            JOIN file_chunks fc ON c.hash = fc.chunk_hash
            JOIN files f ON fc.file_id = f.id
            WHERE f.repo_id = $2
              AND c.embedding IS NOT NULL
              AND vector_norm(c.embedding) > 0
              AND 1 - (c.embedding <=> $1::vector) >= $3
            ORDER BY c.embedding <=> $1::vector
            LIMIT $4
            "#
        );

        self.query_matches(
            &sql,
            vec![
                format_embedding(query.embedding).into(),
                query.repo_id.into(),
                query.threshold.into(),
                (query.limit as i64).into(),
            ],
        )
        .await
    }

    async fn fulltext_search(&self, repo_id: Uuid, query: &str, limit: usize) -> Result<Vec<ChunkMatch>> {
        let sql = format!(
            r#"
            SELECT {MATCH_COLUMNS},
                ts_rank(to_tsvector('english', c.content), websearch_to_tsquery('english', $1))::float8
                    AS similarity
            FROM chunks c
            JOIN file_chunks fc ON c.hash = fc.chunk_hash
            JOIN files f ON fc.file_id = f.id
            WHERE f.repo_id = $2
              AND to_tsvector('english', c.content) @@ websearch_to_tsquery('english', $1)
            ORDER BY similarity DESC
            LIMIT $3
            "#
        );

        self.query_matches(&sql, vec![query.into(), repo_id.into(), (limit as i64).into()])
            .await
    }

    async fn keyword_search(
        &self,
        repo_id: Uuid,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ChunkMatch>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let mut values: Vec<sea_orm::Value> = vec![repo_id.into(), (limit as i64).into()];
        let mut conditions = Vec::with_capacity(keywords.len());
        for keyword in keywords {
            values.push(format!("%{}%", escape_like(keyword)).into());
            conditions.push(format!("c.content ILIKE ${}", values.len()));
        }

        let sql = format!(
            r#"
            SELECT {MATCH_COLUMNS},
                0.0::float8 AS similarity
            FROM chunks c
            JOIN file_chunks fc ON c.hash = fc.chunk_hash
            JOIN files f ON fc.file_id = f.id
            WHERE f.repo_id = $1
              AND ({})
            ORDER BY f.path, fc.chunk_order
            LIMIT $2
            "#,
            conditions.join(" OR ")
        );

        self.query_matches(&sql, values).await
    }

    // ========================================================================
    // Merkle Operations
    // ========================================================================

    async fn upsert_merkle_node(&self, node: NewMerkleNode) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            INSERT INTO merkle_nodes (repo_id, path, hash, node_type, parent_path, updated_at)
            VALUES ($1, $2, $3, 'file', $4, NOW())
            ON CONFLICT (repo_id, path) DO UPDATE SET
                hash = EXCLUDED.hash,
                parent_path = EXCLUDED.parent_path,
                updated_at = EXCLUDED.updated_at
            "#,
            vec![
                node.repo_id.into(),
                node.path.into(),
                node.hash.into(),
                node.parent_path.into(),
            ],
        );

        self.write_conn().execute(stmt).await?;
        Ok(())
    }

    // ========================================================================
    // Suggestion Operations
    // ========================================================================

    async fn create_suggestion(
        &self,
        suggestion: NewSuggestion,
        reviewer_id: Uuid,
    ) -> Result<(Suggestion, ReviewDecision)> {
        let now = chrono::Utc::now();
        let txn = self.write_conn().begin().await?;

        let created = SuggestionActiveModel {
            id: Set(Uuid::new_v4()),
            file_id: Set(suggestion.file_id),
            operations_json: Set(suggestion.operations_json),
            patch_unified_diff: Set(suggestion.patch_unified_diff),
            status: Set(ReviewStatus::Pending.into()),
            confidence: Set(suggestion.confidence),
            model_used: Set(suggestion.model_used),
            created_at: Set(now.into()),
        }
        .insert(&txn)
        .await?;

        let decision = ReviewDecisionActiveModel {
            id: Set(Uuid::new_v4()),
            suggestion_id: Set(created.id),
            reviewer_id: Set(reviewer_id),
            decision: Set(ReviewStatus::Pending.into()),
            created_at: Set(now.into()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok((created, decision))
    }

    // ========================================================================
    // Job Operations
    // ========================================================================

    async fn create_job(&self, task_id: &str, kind: &str, metadata: serde_json::Value) -> Result<Job> {
        let now = chrono::Utc::now();

        let job = JobActiveModel {
            task_id: Set(task_id.to_string()),
            kind: Set(kind.to_string()),
            status: Set(JobStatus::Pending.into()),
            progress: Set(0.0),
            metadata: Set(metadata),
            error_msg: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        job.insert(self.write_conn()).await.map_err(Into::into)
    }

    async fn update_job(&self, task_id: &str, update: JobUpdate) -> Result<Job> {
        let mut job: JobActiveModel = JobEntity::find_by_id(task_id.to_string())
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::JobNotFound {
                id: task_id.to_string(),
            })?
            .into();

        if let Some(status) = update.status {
            job.status = Set(status.into());
        }
        if let Some(progress) = update.progress {
            job.progress = Set(progress.clamp(0.0, 1.0));
        }
        if let Some(metadata) = update.metadata {
            job.metadata = Set(metadata);
        }
        if let Some(error_msg) = update.error_msg {
            job.error_msg = Set(Some(error_msg));
        }
        job.updated_at = Set(chrono::Utc::now().into());

        job.update(self.write_conn()).await.map_err(Into::into)
    }

    async fn find_job(&self, task_id: &str) -> Result<Option<Job>> {
        JobEntity::find_by_id(task_id.to_string())
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }
}
