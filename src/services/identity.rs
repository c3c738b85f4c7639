use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::{
    error::{Error, Result},
    models::{staff::Staff, student::{is_linked, Student}},
    services::{
        directory::DirectoryClient, guardians::GuardianService, staff::StaffService,
        students::StudentService,
    },
};

/// Who a directory sign-in belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Student(Student),
    Staff(Staff),
    /// A guardian acting for the listed students.
    Guardian { external_id: String, students: Vec<Student> },
}

/// Maps directory single-sign-on codes onto local accounts.
#[derive(Clone)]
pub struct IdentityService {
    pool: SqlitePool,
    directory: Arc<dyn DirectoryClient>,
}

impl IdentityService {
    pub fn new(pool: SqlitePool, directory: Arc<dyn DirectoryClient>) -> Self {
        Self { pool, directory }
    }

    /// Students win over staff, staff over guardians.
    pub async fn resolve_auth_code(&self, code: &str) -> Result<Identity> {
        if code.trim().is_empty() {
            return Err(Error::validation("auth code is required"));
        }
        let user = self.directory.resolve_user_by_auth_code(code.trim()).await?;
        if !is_linked(&user.external_id) {
            return Err(Error::validation("directory returned no user for this code"));
        }
        let ext = user.external_id;

        if let Some(student) = StudentService::find_by_external_id(&self.pool, &ext).await? {
            info!("directory user {ext} signed in as student {}", student.id);
            return Ok(Identity::Student(student));
        }
        if let Some(staff) = StaffService::find_by_external_id(&self.pool, &ext).await? {
            info!("directory user {ext} signed in as staff {}", staff.username);
            return Ok(Identity::Staff(staff));
        }
        let students = GuardianService::students_of_guardian(&self.pool, &ext).await?;
        if students.is_empty() {
            return Err(Error::not_found(format!("account linked to directory user {ext}")));
        }
        info!("directory user {ext} signed in as guardian of {} student(s)", students.len());
        Ok(Identity::Guardian { external_id: ext, students })
    }
}
