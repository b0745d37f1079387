//! Link between a file and a chunk, unique on (file_id, chunk_order)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "file_chunks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub file_id: Uuid,

    #[sea_orm(primary_key, auto_increment = false)]
    pub chunk_order: i32,

    #[sea_orm(column_type = "Text")]
    pub chunk_hash: String,

    /// 1-based line range of the chunk inside the file
    pub start_line: i32,

    pub end_line: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::file::Entity",
        from = "Column::FileId",
        to = "super::file::Column::Id",
        on_delete = "Cascade"
    )]
    File,

    #[sea_orm(
        belongs_to = "super::chunk::Entity",
        from = "Column::ChunkHash",
        to = "super::chunk::Column::Hash"
    )]
    Chunk,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl Related<super::chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Chunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
