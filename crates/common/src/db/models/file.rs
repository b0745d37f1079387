//! File entity, unique on (repo_id, path)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub repo_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub path: String,

    /// sha256 of the file content
    #[sea_orm(column_type = "Text")]
    pub content_hash: String,

    /// Content store key, relative to the documents bucket
    #[sea_orm(column_type = "Text")]
    pub storage_key: String,

    pub has_uncommitted_changes: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::repo::Entity",
        from = "Column::RepoId",
        to = "super::repo::Column::Id",
        on_delete = "Cascade"
    )]
    Repo,

    #[sea_orm(has_many = "super::file_chunk::Entity")]
    FileChunk,
}

impl Related<super::repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repo.def()
    }
}

impl Related<super::file_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
