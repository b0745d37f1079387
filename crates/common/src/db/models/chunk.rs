//! Content-addressed chunk entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chunks")]
pub struct Model {
    /// sha256 of `content`
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub hash: String,

    #[sea_orm(column_type = "Text")]
    pub content: String,

    /// pgvector embedding stored as text for SeaORM compatibility
    /// Actual vector operations done via raw SQL
    #[sea_orm(column_type = "Text", nullable)]
    pub embedding: Option<String>,

    /// Token count under the embedding model's encoding
    pub token_count: i32,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file_chunk::Entity")]
    FileChunk,
}

impl Related<super::file_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse embedding from stored text format to Vec<f32>
    pub fn parse_embedding(&self) -> Option<Vec<f32>> {
        self.embedding.as_deref().and_then(parse_embedding)
    }
}

/// Format a vector in pgvector's text form: "[1,2.5,3]"
pub fn format_embedding(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Parse pgvector's text form
pub fn parse_embedding(text: &str) -> Option<Vec<f32>> {
    let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|v| v.trim().parse::<f32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_text_format() {
        let text = format_embedding(&[0.5, -1.0, 2.25]);
        assert_eq!(text, "[0.5,-1,2.25]");
        assert_eq!(parse_embedding(&text), Some(vec![0.5, -1.0, 2.25]));
    }

    #[test]
    fn test_invalid_embedding_text() {
        assert_eq!(parse_embedding("[1,abc]"), None);
        assert_eq!(parse_embedding("[]"), Some(vec![]));
    }
}
