use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// External id stored for students that are not linked to the directory.
pub const UNLINKED: &str = "0";

/// True when `ext` names a real directory user.
pub fn is_linked(ext: &str) -> bool {
    let ext = ext.trim();
    !ext.is_empty() && ext != UNLINKED
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Student {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub class: String,
    pub external_id: String,
    #[sqlx(rename = "last_collection_date")]
    pub last_collection_day: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStudent {
    pub full_name: String,
    pub class: String,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentUpdate {
    pub full_name: Option<String>,
    pub class: Option<String>,
    pub external_id: Option<String>,
}
