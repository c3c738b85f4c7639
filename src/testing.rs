//! Shared fixtures for the unit tests: a migrated scratch database with every
//! service wired to a manual clock, and in-memory fakes for the directory,
//! the notification channel and scheduled job bodies.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::{
    clock::{ManualClock, SequentialIds},
    db,
    error::{Error, Result, NO_DATA_CODE},
    models::{
        directory::{Department, DirectoryUser, GuardianRelation, Page},
        meal::{Meal, MealDraft},
        notification::ActionCard,
        selection::Variant,
        student::{NewStudent, Student},
    },
    services::{
        activity_log::ActivityLog,
        catalog::MealCatalog,
        collection::CollectionRecorder,
        directory::DirectoryClient,
        notifications::{Notifier, ReminderService},
        scheduler::{JobActions, JobKind},
        selection::SelectionEngine,
        students::StudentService,
        token::TokenCipher,
    },
};

/// A minute in March 2025.
pub fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .unwrap()
}

pub fn meal_draft(
    name: &str,
    selection_start: NaiveDateTime,
    selection_end: NaiveDateTime,
    effective_start: NaiveDateTime,
    effective_end: NaiveDateTime,
) -> MealDraft {
    MealDraft {
        name: name.into(),
        selection_start,
        selection_end,
        effective_start,
        effective_end,
        image_ref: String::new(),
    }
}

/// A meal as the catalog would return it, without touching a store.
pub fn meal_row(
    id: i64,
    selection_start: NaiveDateTime,
    selection_end: NaiveDateTime,
    effective_start: NaiveDateTime,
    effective_end: NaiveDateTime,
) -> Meal {
    Meal {
        id,
        name: format!("Meal {id}"),
        selection_start,
        selection_end,
        effective_start,
        effective_end,
        image_ref: String::new(),
    }
}

pub struct TestDb {
    _dir: TempDir,
    pub pool: SqlitePool,
    pub clock: Arc<ManualClock>,
    pub ids: Arc<SequentialIds>,
    pub image_dir: TempDir,
    pub tokens: TokenCipher,
    pub catalog: MealCatalog,
    pub engine: SelectionEngine,
    pub recorder: CollectionRecorder,
    pub notifier: Arc<RecordingNotifier>,
    pub reminders: ReminderService,
    pub log: ActivityLog,
}

impl TestDb {
    /// Clock starts at 2025-03-01 00:00.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::create_pool(&dir.path().join("canteen.db")).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let clock = Arc::new(ManualClock::new(at(1, 0, 0)));
        let image_dir = tempfile::tempdir().unwrap();
        let tokens = TokenCipher::new(&[7u8; 32]);
        let catalog = MealCatalog::new(pool.clone(), clock.clone(), image_dir.path());
        let engine = SelectionEngine::new(pool.clone(), clock.clone(), catalog.clone());
        let recorder =
            CollectionRecorder::new(pool.clone(), clock.clone(), tokens.clone(), engine.clone());
        let notifier = Arc::new(RecordingNotifier::default());
        let reminders = ReminderService::new(
            pool.clone(),
            clock.clone(),
            catalog.clone(),
            notifier.clone(),
            "http://canteen.test",
        );
        let log = ActivityLog::new(clock.clone());

        Self {
            _dir: dir,
            pool,
            clock,
            ids: Arc::new(SequentialIds::default()),
            image_dir,
            tokens,
            catalog,
            engine,
            recorder,
            notifier,
            reminders,
            log,
        }
    }

    pub async fn student(&self, name: &str, class: &str, external_id: Option<&str>) -> Student {
        StudentService::create(
            &self.pool,
            &NewStudent {
                full_name: name.into(),
                class: class.into(),
                external_id: external_id.map(str::to_string),
            },
        )
        .await
        .unwrap()
    }

    /// Week 10: selection 03-01 08:00 to 03-03 18:00, served 03-04 to 03-10.
    pub async fn week_meal(&self) -> Meal {
        self.catalog
            .create(&meal_draft("Week 10", at(1, 8, 0), at(3, 18, 0), at(4, 0, 0), at(10, 23, 59)))
            .await
            .unwrap()
    }

    /// Writes a choice directly, bypassing window checks.
    pub async fn pick(&self, student_id: i64, meal_id: i64, variant: Variant) {
        sqlx::query(
            "INSERT INTO meal_selections (student_id, meal_id, variant) VALUES (?1, ?2, ?3)
             ON CONFLICT (student_id, meal_id) DO UPDATE SET variant = excluded.variant",
        )
        .bind(student_id)
        .bind(meal_id)
        .bind(variant.as_str())
        .execute(&self.pool)
        .await
        .unwrap();
    }
}

/// Records every batch; batches whose index was passed to
/// [`RecordingNotifier::fail_batch`] are rejected.
#[derive(Default)]
pub struct RecordingNotifier {
    attempts: Mutex<Vec<Vec<String>>>,
    sent: Mutex<Vec<(Vec<String>, ActionCard)>>,
    failing: Mutex<HashSet<usize>>,
}

impl RecordingNotifier {
    /// Zero-based attempt index.
    pub fn fail_batch(&self, index: usize) {
        self.failing.lock().unwrap().insert(index);
    }

    pub fn attempts(&self) -> Vec<Vec<String>> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(Vec<String>, ActionCard)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipients: &[String], card: &ActionCard) -> Result<()> {
        let index = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(recipients.to_vec());
            attempts.len() - 1
        };
        if self.failing.lock().unwrap().contains(&index) {
            return Err(Error::Upstream { code: 400_001, message: "rejected".into() });
        }
        self.sent.lock().unwrap().push((recipients.to_vec(), card.clone()));
        Ok(())
    }
}

/// An in-memory department tree.
#[derive(Default)]
pub struct FakeDirectory {
    children: HashMap<Option<i64>, Vec<Department>>,
    relations: HashMap<i64, Vec<GuardianRelation>>,
    failing_classes: HashSet<i64>,
    no_data: HashSet<i64>,
    root_fails: bool,
    auth_codes: HashMap<String, String>,
}

impl FakeDirectory {
    pub fn dept(&mut self, parent: Option<i64>, id: i64, kind: &str, name: &str) {
        self.children.entry(parent).or_default().push(Department {
            id,
            kind: kind.into(),
            name: name.into(),
        });
    }

    pub fn relation(&mut self, class_id: i64, guardian: &str, student: &str) {
        self.relations.entry(class_id).or_default().push(GuardianRelation {
            guardian_ext_id: guardian.into(),
            student_ext_id: student.into(),
            relation_name: "parent".into(),
        });
    }

    pub fn fail_class(&mut self, class_id: i64) {
        self.failing_classes.insert(class_id);
    }

    pub fn no_data_under(&mut self, dept_id: i64) {
        self.no_data.insert(dept_id);
    }

    pub fn fail_root(&mut self) {
        self.root_fails = true;
    }

    pub fn auth_code(&mut self, code: &str, external_id: &str) {
        self.auth_codes.insert(code.into(), external_id.into());
    }
}

fn page_of<T: Clone>(items: &[T], page_no: u32, page_size: u32) -> Page<T> {
    let size = page_size.max(1) as usize;
    let start = (page_no.max(1) as usize - 1) * size;
    let end = (start + size).min(items.len());
    if start >= items.len() {
        return Page::empty();
    }
    Page { items: items[start..end].to_vec(), has_more: end < items.len() }
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn list_child_departments(
        &self,
        parent: Option<i64>,
        page_no: u32,
        page_size: u32,
    ) -> Result<Page<Department>> {
        if parent.is_none() && self.root_fails {
            return Err(Error::Upstream { code: 50_002, message: "directory unavailable".into() });
        }
        if parent.is_some_and(|id| self.no_data.contains(&id)) {
            return Err(Error::Upstream { code: NO_DATA_CODE, message: "no data".into() });
        }
        let items = self.children.get(&parent).map(Vec::as_slice).unwrap_or_default();
        Ok(page_of(items, page_no, page_size))
    }

    async fn list_class_relations(
        &self,
        class_id: i64,
        page_no: u32,
        page_size: u32,
    ) -> Result<Page<GuardianRelation>> {
        if self.failing_classes.contains(&class_id) {
            return Err(Error::Upstream { code: 50_003, message: format!("class {class_id} failed") });
        }
        let items = self.relations.get(&class_id).map(Vec::as_slice).unwrap_or_default();
        Ok(page_of(items, page_no, page_size))
    }

    async fn resolve_user_by_auth_code(&self, code: &str) -> Result<DirectoryUser> {
        self.auth_codes
            .get(code)
            .map(|id| DirectoryUser { external_id: id.clone() })
            .ok_or_else(|| Error::Upstream { code: 40_078, message: "unknown auth code".into() })
    }
}

/// Job bodies that only remember they ran.
#[derive(Default)]
pub struct RecordingJobs {
    calls: Mutex<Vec<JobKind>>,
    fail: bool,
    delay: Duration,
}

impl RecordingJobs {
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    /// Each body takes `delay` of tokio time.
    pub fn slow(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    pub fn calls(&self) -> Vec<JobKind> {
        self.calls.lock().unwrap().clone()
    }

    async fn run(&self, kind: JobKind) -> Result<String> {
        self.calls.lock().unwrap().push(kind);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(Error::Transient("job body failed".into()));
        }
        Ok(format!("{kind:?} done"))
    }
}

#[async_trait]
impl JobActions for RecordingJobs {
    async fn cleanup_expired(&self) -> Result<String> {
        self.run(JobKind::Cleanup).await
    }

    async fn notify_unselected(&self, meal_id: i64) -> Result<String> {
        self.run(JobKind::Reminder(meal_id)).await
    }

    async fn auto_fill(&self, meal_id: i64) -> Result<String> {
        self.run(JobKind::AutoSelect(meal_id)).await
    }
}
