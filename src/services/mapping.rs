use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{stream, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::{
    clock::IdGen,
    error::{Error, Result},
    models::{
        directory::{Department, GuardianRelation},
        guardian::GuardianLink,
        student::is_linked,
    },
    services::{
        activity_log::ActivityLog,
        directory::{DirectoryClient, Pacer},
        guardians::GuardianService,
        tasks::TaskQueue,
    },
};

const PAGE_SIZE: u32 = 30;
const CLASS_CONCURRENCY: usize = 2;
pub const DEFAULT_PACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebuildState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebuildOutcome {
    Success,
    PartialFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub run_id: u64,
    pub classes_total: usize,
    pub classes_succeeded: usize,
    pub classes_failed: usize,
    pub relations_written: u64,
    pub outcome: RebuildOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildStatus {
    pub state: RebuildState,
    pub last_report: Option<RebuildReport>,
}

/// Rebuilds the guardian→student table from the directory's class tree.
/// At most one rebuild runs at a time.
#[derive(Clone)]
pub struct MappingRebuilder {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    directory: Arc<dyn DirectoryClient>,
    ids: Arc<dyn IdGen>,
    log: ActivityLog,
    pacer: Pacer,
    running: AtomicBool,
    cancel: AtomicBool,
    last_report: Mutex<Option<RebuildReport>>,
}

/// Held for the duration of a run; releases the singleton on drop.
pub struct RunGuard {
    inner: Arc<Inner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.cancel.store(false, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl MappingRebuilder {
    pub fn new(
        pool: SqlitePool,
        directory: Arc<dyn DirectoryClient>,
        ids: Arc<dyn IdGen>,
        log: ActivityLog,
    ) -> Self {
        Self::with_pace(pool, directory, ids, log, DEFAULT_PACE)
    }

    pub fn with_pace(
        pool: SqlitePool,
        directory: Arc<dyn DirectoryClient>,
        ids: Arc<dyn IdGen>,
        log: ActivityLog,
        pace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                directory,
                ids,
                log,
                pacer: Pacer::new(pace),
                running: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                last_report: Mutex::new(None),
            }),
        }
    }

    /// Runs a rebuild to completion on the caller's task.
    pub async fn run(&self) -> Result<RebuildReport> {
        let guard = self.claim()?;
        self.run_claimed(guard).await
    }

    /// Claims the rebuilder and hands the run to the background queue.
    /// Returns as soon as the run is queued.
    pub fn start(&self, tasks: &TaskQueue) -> Result<()> {
        let guard = self.claim()?;
        let this = self.clone();
        tasks.spawn("mapping rebuild", async move {
            this.run_claimed(guard).await.map(|_| ())
        });
        Ok(())
    }

    /// Asks a running rebuild to stop at the next page boundary.
    pub fn cancel(&self) {
        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.cancel.store(true, Ordering::SeqCst);
            self.inner.log.push("mapping rebuild: cancellation requested");
        }
    }

    pub fn status(&self) -> RebuildStatus {
        let state = if self.inner.running.load(Ordering::SeqCst) {
            RebuildState::Running
        } else {
            RebuildState::Idle
        };
        let last_report = self.inner.last_report.lock().unwrap_or_else(|e| e.into_inner()).clone();
        RebuildStatus { state, last_report }
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.log.snapshot()
    }

    fn claim(&self) -> Result<RunGuard> {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::Busy("a mapping rebuild is already running".into()))?;
        self.inner.cancel.store(false, Ordering::SeqCst);
        Ok(RunGuard { inner: self.inner.clone() })
    }

    async fn run_claimed(&self, _guard: RunGuard) -> Result<RebuildReport> {
        let run_id = self.inner.ids.next_id();
        let log = &self.inner.log;
        log.push(format!("mapping rebuild #{run_id} started"));

        let result = self.rebuild(run_id).await;
        match &result {
            Ok(report) => {
                log.push(format!(
                    "mapping rebuild #{run_id} finished: {} of {} classes ok, {} failed, {} relations written",
                    report.classes_succeeded, report.classes_total, report.classes_failed, report.relations_written
                ));
                *self.inner.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
            }
            Err(e) => log.push(format!("mapping rebuild #{run_id} aborted: {e}")),
        }
        result
    }

    async fn rebuild(&self, run_id: u64) -> Result<RebuildReport> {
        let classes = self.discover_classes().await?;
        let total = classes.len();
        self.inner.log.push(format!("found {total} classes"));

        let fetched: Vec<(Department, Result<Vec<GuardianRelation>>)> = stream::iter(classes)
            .map(|class| async move {
                let relations = self.fetch_class(&class).await;
                (class, relations)
            })
            .buffer_unordered(CLASS_CONCURRENCY)
            .collect()
            .await;
        self.check_cancel()?;

        let mut links = Vec::new();
        let (mut succeeded, mut failed) = (0, 0);
        for (class, relations) in fetched {
            match relations {
                Ok(relations) => {
                    succeeded += 1;
                    self.inner.log.push(format!(
                        "class {} ({}): {} relations",
                        class.name,
                        class.id,
                        relations.len()
                    ));
                    links.extend(
                        relations
                            .into_iter()
                            .filter(|r| is_linked(&r.guardian_ext_id) && is_linked(&r.student_ext_id))
                            .map(|r| GuardianLink {
                                guardian_ext_id: r.guardian_ext_id,
                                student_ext_id: r.student_ext_id,
                            }),
                    );
                }
                Err(e) => {
                    failed += 1;
                    self.inner.log.push(format!("class {} ({}) failed: {e}", class.name, class.id));
                }
            }
        }

        let relations_written = GuardianService::replace_all(&self.inner.pool, &links).await?;
        Ok(RebuildReport {
            run_id,
            classes_total: total,
            classes_succeeded: succeeded,
            classes_failed: failed,
            relations_written,
            outcome: if failed == 0 { RebuildOutcome::Success } else { RebuildOutcome::PartialFailure },
        })
    }

    /// Depth-first walk of the department tree collecting class nodes.
    /// A failing subtree is skipped; a failing root aborts.
    async fn discover_classes(&self) -> Result<Vec<Department>> {
        let mut classes = Vec::new();
        let mut stack: Vec<Option<i64>> = vec![None];

        while let Some(parent) = stack.pop() {
            let mut page_no = 1;
            loop {
                self.check_cancel()?;
                self.inner.pacer.wait().await;
                let page = match self
                    .inner
                    .directory
                    .list_child_departments(parent, page_no, PAGE_SIZE)
                    .await
                {
                    Ok(page) => page,
                    Err(e) if e.is_no_data() => break,
                    Err(e) if parent.is_none() => return Err(e),
                    Err(e) => {
                        self.inner.log.push(format!(
                            "department {} skipped: {e}",
                            parent.unwrap_or_default()
                        ));
                        break;
                    }
                };
                for dept in page.items {
                    if dept.is_class() {
                        classes.push(dept);
                    } else {
                        stack.push(Some(dept.id));
                    }
                }
                if !page.has_more {
                    break;
                }
                page_no += 1;
            }
        }
        Ok(classes)
    }

    async fn fetch_class(&self, class: &Department) -> Result<Vec<GuardianRelation>> {
        let mut out = Vec::new();
        let mut page_no = 1;
        loop {
            self.check_cancel()?;
            self.inner.pacer.wait().await;
            let page = match self
                .inner
                .directory
                .list_class_relations(class.id, page_no, PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_no_data() => break,
                Err(e) => return Err(e),
            };
            out.extend(page.items);
            if !page.has_more {
                break;
            }
            page_no += 1;
        }
        Ok(out)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.inner.cancel.load(Ordering::SeqCst) {
            Err(Error::Cancelled("mapping rebuild".into()))
        } else {
            Ok(())
        }
    }
}
