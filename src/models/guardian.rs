use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, FromRow)]
pub struct GuardianLink {
    pub guardian_ext_id: String,
    pub student_ext_id: String,
}
