//! Merkle node entity: one node per file, unique on (repo_id, path)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "merkle_nodes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub repo_id: Uuid,

    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub path: String,

    #[sea_orm(column_type = "Text")]
    pub hash: String,

    /// Always "file" for the flat layout
    #[sea_orm(column_type = "Text")]
    pub node_type: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub parent_path: Option<String>,

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
}

impl Related<super::repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
