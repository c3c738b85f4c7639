use serde::{Deserialize, Serialize};

/// Department kind the directory uses for a school class.
pub const CLASS_KIND: &str = "class";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: i64,
    pub kind: String,
    pub name: String,
}

impl Department {
    pub fn is_class(&self) -> bool {
        self.kind == CLASS_KIND
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianRelation {
    pub guardian_ext_id: String,
    pub student_ext_id: String,
    pub relation_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub external_id: String,
}

/// One page of a paged directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self { items: Vec::new(), has_more: false }
    }
}
