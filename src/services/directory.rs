use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    error::Result,
    models::directory::{Department, DirectoryUser, GuardianRelation, Page},
};

/// The school's corporate directory.
///
/// Any method may fail with the "no data" upstream code
/// ([`crate::error::NO_DATA_CODE`]); callers treat that as an empty result.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Children of `parent`, or of the root when `parent` is `None`.
    /// Pages are numbered from 1.
    async fn list_child_departments(
        &self,
        parent: Option<i64>,
        page_no: u32,
        page_size: u32,
    ) -> Result<Page<Department>>;

    async fn list_class_relations(
        &self,
        class_id: i64,
        page_no: u32,
        page_size: u32,
    ) -> Result<Page<GuardianRelation>>;

    async fn resolve_user_by_auth_code(&self, code: &str) -> Result<DirectoryUser>;
}

/// Spaces out calls so that consecutive ones start at least `interval` apart.
pub struct Pacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(None) }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready = prev + self.interval;
            if ready > Instant::now() {
                tokio::time::sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
    }
}
