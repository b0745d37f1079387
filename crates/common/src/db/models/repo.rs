//! Repository entity: a documentation source tracked by the index

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "repos")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Source identifier, e.g. "owner/name"
    #[sea_orm(column_type = "Text")]
    pub full_name: String,

    #[sea_orm(column_type = "Text")]
    pub branch: String,

    /// Subdirectory holding the documentation
    #[sea_orm(column_type = "Text")]
    pub docs_directory: String,

    /// Merkle root of the last indexed snapshot
    #[sea_orm(column_type = "Text", nullable)]
    pub root_hash: Option<String>,

    /// Revision of the last hard index
    #[sea_orm(column_type = "Text", nullable)]
    pub last_sync_sha: Option<String>,

    pub last_synced_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file::Entity")]
    File,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
