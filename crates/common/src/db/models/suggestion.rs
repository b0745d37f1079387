//! Suggestion entity: reviewable edits for one file

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Review state shared by suggestions and review decisions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Accepted => "accepted",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

impl From<String> for ReviewStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "accepted" => ReviewStatus::Accepted,
            "rejected" => ReviewStatus::Rejected,
            _ => ReviewStatus::Pending,
        }
    }
}

impl From<ReviewStatus> for String {
    fn from(status: ReviewStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "suggestions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub file_id: Uuid,

    /// Serialized operations array
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub operations_json: Option<Json>,

    /// Alternative payload: a unified diff against the file
    #[sea_orm(column_type = "Text", nullable)]
    pub patch_unified_diff: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub confidence: f64,

    #[sea_orm(column_type = "Text")]
    pub model_used: String,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn review_status(&self) -> ReviewStatus {
        ReviewStatus::from(self.status.clone())
    }
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

    #[sea_orm(has_one = "super::review_decision::Entity")]
    ReviewDecision,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl Related<super::review_decision::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ReviewDecision.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
