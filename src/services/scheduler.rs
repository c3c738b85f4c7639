use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{
    clock::{Clock, IdGen},
    config::SchedulerConfig,
    error::Result,
    models::meal::Meal,
    services::{
        activity_log::ActivityLog, catalog::MealCatalog, notifications::ReminderService,
        selection::SelectionEngine,
    },
};

/// Job bodies that may run at the same time.
pub const WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobKind {
    Cleanup,
    Reminder(i64),
    AutoSelect(i64),
}

impl JobKind {
    pub fn key(&self) -> String {
        match self {
            JobKind::Cleanup => "cleanup".to_string(),
            JobKind::Reminder(id) => format!("reminder_{id}"),
            JobKind::AutoSelect(id) => format!("autoselect_{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trigger {
    Daily(NaiveTime),
    Once(NaiveDateTime),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Daily(t) => write!(f, "daily at {}", t.format("%H:%M")),
            Trigger::Once(at) => write!(f, "at {}", at.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSpec {
    pub kind: JobKind,
    pub trigger: Trigger,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub installed: Vec<String>,
    pub cancelled: Vec<String>,
    pub rescheduled: Vec<String>,
    pub unchanged: usize,
}

/// The job set implied by `config` and the catalog at `now`.
///
/// One-shot jobs are only included while their fire time is in the future.
pub fn desired_jobs(
    config: &SchedulerConfig,
    meals: &[Meal],
    now: NaiveDateTime,
) -> Result<BTreeMap<String, JobSpec>> {
    let mut jobs = BTreeMap::new();
    if !config.enabled {
        return Ok(jobs);
    }
    let mut add = |kind: JobKind, trigger: Trigger| {
        jobs.insert(kind.key(), JobSpec { kind, trigger });
    };

    if config.cleanup_enabled {
        add(JobKind::Cleanup, Trigger::Daily(config.cleanup_time()?));
    }
    let lead = ChronoDuration::hours(i64::from(config.reminder_before_end_hours));
    for meal in meals {
        let remind_at = meal.selection_end - lead;
        if config.reminder_enabled && remind_at > now {
            add(JobKind::Reminder(meal.id), Trigger::Once(remind_at));
        }
        if config.auto_select_enabled && meal.selection_end > now {
            add(JobKind::AutoSelect(meal.id), Trigger::Once(meal.selection_end));
        }
    }
    Ok(jobs)
}

/// First instant strictly after `after` whose wall-clock time is `at`.
pub fn next_daily(at: NaiveTime, after: NaiveDateTime) -> NaiveDateTime {
    let today = after.date().and_time(at);
    if today > after {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

/// What the scheduled jobs actually do. Each returns a one-line summary.
#[async_trait]
pub trait JobActions: Send + Sync {
    async fn cleanup_expired(&self) -> Result<String>;
    async fn notify_unselected(&self, meal_id: i64) -> Result<String>;
    async fn auto_fill(&self, meal_id: i64) -> Result<String>;
}

/// Job bodies backed by the catalog, selection engine and reminders.
pub struct CanteenJobs {
    pub catalog: MealCatalog,
    pub selections: SelectionEngine,
    pub reminders: ReminderService,
}

#[async_trait]
impl JobActions for CanteenJobs {
    async fn cleanup_expired(&self) -> Result<String> {
        let n = self.catalog.cleanup_expired().await?;
        Ok(format!("removed {n} expired meal(s)"))
    }

    async fn notify_unselected(&self, meal_id: i64) -> Result<String> {
        let r = self.reminders.notify_unselected(meal_id).await?;
        Ok(format!(
            "{} recipient(s), {} batch(es) sent, {} failed",
            r.recipients, r.batches_sent, r.batches_failed
        ))
    }

    async fn auto_fill(&self, meal_id: i64) -> Result<String> {
        let n = self.selections.auto_fill(meal_id).await?;
        Ok(format!("assigned {n} student(s)"))
    }
}

/// Keeps the installed timers equal to [`desired_jobs`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: StdMutex<SchedulerConfig>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    actions: Arc<dyn JobActions>,
    log: ActivityLog,
    jobs: Mutex<HashMap<String, Installed>>,
    workers: Arc<Semaphore>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

struct Installed {
    spec: JobSpec,
    generation: u64,
    timer: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        actions: Arc<dyn JobActions>,
        log: ActivityLog,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: StdMutex::new(config),
                clock,
                ids,
                actions,
                log,
                jobs: Mutex::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(WORKERS)),
                generation: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                listener: StdMutex::new(None),
            }),
        }
    }

    /// Reconciles against the current catalog, then again after every
    /// catalog change until shutdown.
    pub async fn start(&self, catalog: MealCatalog) -> Result<ReconcileReport> {
        let mut events = catalog.subscribe();
        let report = self.reconcile(&catalog.list_all().await?).await?;
        self.inner.log.push("scheduler started");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let meals = match catalog.list_all().await {
                    Ok(meals) => meals,
                    Err(e) => {
                        this.inner.log.push(format!("reconcile skipped: cannot load meals: {e}"));
                        continue;
                    }
                };
                if let Err(e) = this.reconcile(&meals).await {
                    this.inner.log.push(format!("reconcile failed: {e}"));
                }
            }
        });
        *self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(report)
    }

    /// Swaps the configuration and reconciles under it.
    pub async fn apply_config(&self, config: SchedulerConfig, meals: &[Meal]) -> Result<ReconcileReport> {
        config.cleanup_time()?;
        *self.inner.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
        self.reconcile(meals).await
    }

    pub async fn reconcile(&self, meals: &[Meal]) -> Result<ReconcileReport> {
        let now = self.inner.clock.now();
        let config = self.inner.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let desired = desired_jobs(&config, meals, now)?;

        let mut report = ReconcileReport::default();
        let mut jobs = self.inner.jobs.lock().await;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Ok(report);
        }

        let stale: Vec<String> = jobs.keys().filter(|k| !desired.contains_key(*k)).cloned().collect();
        for key in stale {
            let due = matches!(
                jobs.get(&key).map(|j| j.spec.trigger),
                Some(Trigger::Once(at)) if at <= now
            );
            if due {
                // about to fire; it removes itself
                continue;
            }
            if let Some(job) = jobs.remove(&key) {
                job.timer.abort();
                self.inner.log.push(format!("cancelled job {key}"));
                report.cancelled.push(key);
            }
        }

        for (key, spec) in desired {
            match jobs.get(&key) {
                Some(existing) if existing.spec == spec => {
                    report.unchanged += 1;
                    continue;
                }
                Some(existing) => {
                    existing.timer.abort();
                    self.inner.log.push(format!("rescheduled job {key} {}", spec.trigger));
                    report.rescheduled.push(key.clone());
                }
                None => {
                    self.inner.log.push(format!("installed job {key} {}", spec.trigger));
                    report.installed.push(key.clone());
                }
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
            let timer = spawn_timer(self.inner.clone(), key.clone(), spec, generation);
            jobs.insert(key, Installed { spec, generation, timer });
        }

        if !config.enabled && !report.cancelled.is_empty() {
            self.inner.log.push("scheduler disabled: all jobs cleared");
        }
        Ok(report)
    }

    pub async fn installed(&self) -> BTreeMap<String, Trigger> {
        let jobs = self.inner.jobs.lock().await;
        jobs.iter().map(|(k, j)| (k.clone(), j.spec.trigger)).collect()
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.log.snapshot()
    }

    /// Stops every timer and refuses new fires, then waits up to `grace`
    /// for running jobs. Returns whether they all finished.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Some(listener) = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            listener.abort();
        }
        {
            let mut jobs = self.inner.jobs.lock().await;
            for (_, job) in jobs.drain() {
                job.timer.abort();
            }
        }

        let drained = tokio::time::timeout(grace, self.inner.workers.acquire_many(WORKERS as u32))
            .await
            .map(|permits| permits.is_ok())
            .unwrap_or(false);
        if drained {
            self.inner.log.push("scheduler stopped");
        } else {
            self.inner.log.push(format!("scheduler stopped with jobs still running after {grace:?}"));
        }
        drained
    }
}

fn spawn_timer(inner: Arc<Inner>, key: String, spec: JobSpec, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut prev: Option<NaiveDateTime> = None;
        loop {
            let now = inner.clock.now();
            let base = prev.map_or(now, |p| p.max(now));
            let at = match spec.trigger {
                Trigger::Once(at) => at,
                Trigger::Daily(time) => next_daily(time, base),
            };
            let delay = (at - base).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;

            match spec.trigger {
                Trigger::Once(_) => {
                    {
                        let mut jobs = inner.jobs.lock().await;
                        if jobs.get(&key).map(|j| j.generation) == Some(generation) {
                            jobs.remove(&key);
                        }
                    }
                    fire(&inner, &key, spec.kind);
                    return;
                }
                Trigger::Daily(_) => {
                    fire(&inner, &key, spec.kind);
                    prev = Some(at);
                }
            }
        }
    })
}

/// Runs the job body on the worker pool. Never blocks the timer and never
/// lets an error escape.
fn fire(inner: &Arc<Inner>, key: &str, kind: JobKind) {
    if inner.shutting_down.load(Ordering::SeqCst) {
        inner.log.push(format!("job {key} skipped: scheduler shutting down"));
        return;
    }
    let inner = inner.clone();
    let key = key.to_string();
    tokio::spawn(async move {
        let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
            warn!("job {key} dropped: worker pool closed");
            return;
        };
        if inner.shutting_down.load(Ordering::SeqCst) {
            inner.log.push(format!("job {key} skipped: scheduler shutting down"));
            return;
        }
        let run_id = inner.ids.next_id();
        inner.log.push(format!("job {key} run #{run_id} started"));
        let outcome = match kind {
            JobKind::Cleanup => inner.actions.cleanup_expired().await,
            JobKind::Reminder(meal_id) => inner.actions.notify_unselected(meal_id).await,
            JobKind::AutoSelect(meal_id) => inner.actions.auto_fill(meal_id).await,
        };
        match outcome {
            Ok(summary) => inner.log.push(format!("job {key} run #{run_id} finished: {summary}")),
            Err(e) => inner.log.push(format!("job {key} run #{run_id} failed: {e}")),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::testing::{at, meal_draft, meal_row, RecordingJobs, TestDb};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            cleanup_time: "02:00".into(),
            reminder_before_end_hours: 6,
            cleanup_enabled: false,
            reminder_enabled: true,
            auto_select_enabled: true,
        }
    }

    fn week10() -> Meal {
        meal_row(1, at(1, 8, 0), at(3, 18, 0), at(4, 0, 0), at(10, 23, 59))
    }

    fn scheduler(config: SchedulerConfig, clock: Arc<ManualClock>, jobs: Arc<RecordingJobs>) -> Scheduler {
        Scheduler::new(
            config,
            clock.clone(),
            Arc::new(SequentialIds::default()),
            jobs,
            ActivityLog::new(clock),
        )
    }

    #[test]
    fn desired_set_follows_config_and_time() {
        let meals = vec![week10()];
        let jobs = desired_jobs(&config(), &meals, at(1, 9, 0)).unwrap();
        assert_eq!(jobs["reminder_1"].trigger, Trigger::Once(at(3, 12, 0)));
        assert_eq!(jobs["autoselect_1"].trigger, Trigger::Once(at(3, 18, 0)));
        assert!(!jobs.contains_key("cleanup"));

        // reminder time passed, auto-select still ahead
        let later = desired_jobs(&config(), &meals, at(3, 12, 0)).unwrap();
        assert_eq!(later.keys().collect::<Vec<_>>(), vec!["autoselect_1"]);

        let off = SchedulerConfig { enabled: false, ..config() };
        assert!(desired_jobs(&off, &meals, at(1, 9, 0)).unwrap().is_empty());

        let with_cleanup = SchedulerConfig { cleanup_enabled: true, ..config() };
        let jobs = desired_jobs(&with_cleanup, &[], at(1, 9, 0)).unwrap();
        assert_eq!(jobs["cleanup"].trigger, Trigger::Daily(NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
    }

    #[test]
    fn next_daily_is_strictly_after() {
        let two = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        assert_eq!(next_daily(two, at(1, 1, 59)), at(1, 2, 0));
        assert_eq!(next_daily(two, at(1, 2, 0)), at(2, 2, 0));
        assert_eq!(next_daily(two, at(1, 9, 0)), at(2, 2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn reminder_fires_once_and_uninstalls() {
        let clock = Arc::new(ManualClock::new(at(1, 9, 0)));
        let jobs = Arc::new(RecordingJobs::default());
        let sched = scheduler(config(), clock, jobs.clone());

        let report = sched.reconcile(&[week10()]).await.unwrap();
        assert_eq!(report.installed, vec!["autoselect_1".to_string(), "reminder_1".to_string()]);

        // 2025-03-01 09:00 -> 2025-03-03 12:00
        tokio::time::sleep(Duration::from_secs(51 * 3600 + 1)).await;
        assert_eq!(jobs.calls(), vec![JobKind::Reminder(1)]);
        let installed = sched.installed().await;
        assert!(!installed.contains_key("reminder_1"));
        assert!(installed.contains_key("autoselect_1"));

        tokio::time::sleep(Duration::from_secs(6 * 3600)).await;
        assert_eq!(jobs.calls(), vec![JobKind::Reminder(1), JobKind::AutoSelect(1)]);
        assert!(sched.installed().await.is_empty());
        assert!(sched.logs().iter().any(|l| l.contains("job reminder_1 run #1 finished")));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_is_idempotent_and_reschedules_moved_meals() {
        let clock = Arc::new(ManualClock::new(at(1, 9, 0)));
        let jobs = Arc::new(RecordingJobs::default());
        let sched = scheduler(config(), clock, jobs.clone());

        sched.reconcile(&[week10()]).await.unwrap();
        let before = sched.installed().await;
        let again = sched.reconcile(&[week10()]).await.unwrap();
        assert_eq!(again, ReconcileReport { unchanged: 2, ..Default::default() });
        assert_eq!(sched.installed().await, before);

        // selection extended by a day; the collection window moves with it
        let moved = meal_row(1, at(1, 8, 0), at(4, 18, 0), at(5, 0, 0), at(11, 23, 59));
        let report = sched.reconcile(&[moved]).await.unwrap();
        assert_eq!(report.rescheduled.len(), 2);
        let installed = sched.installed().await;
        assert_eq!(installed["reminder_1"], Trigger::Once(at(4, 12, 0)));
        assert_eq!(installed["autoselect_1"], Trigger::Once(at(4, 18, 0)));

        // the old fire time passes without anything running
        tokio::time::sleep(Duration::from_secs(51 * 3600 + 1)).await;
        assert!(jobs.calls().is_empty());
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(jobs.calls(), vec![JobKind::Reminder(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_meals_and_disabled_config_cancel_jobs() {
        let clock = Arc::new(ManualClock::new(at(1, 9, 0)));
        let jobs = Arc::new(RecordingJobs::default());
        let sched = scheduler(SchedulerConfig { cleanup_enabled: true, ..config() }, clock, jobs.clone());

        sched.reconcile(&[week10()]).await.unwrap();
        let mut cancelled = sched.reconcile(&[]).await.unwrap().cancelled;
        cancelled.sort();
        assert_eq!(cancelled, vec!["autoselect_1".to_string(), "reminder_1".to_string()]);
        assert_eq!(sched.installed().await.keys().collect::<Vec<_>>(), vec!["cleanup"]);

        let off = sched
            .apply_config(SchedulerConfig { enabled: false, ..config() }, &[week10()])
            .await
            .unwrap();
        assert_eq!(off.cancelled, vec!["cleanup".to_string()]);
        assert!(sched.installed().await.is_empty());

        tokio::time::sleep(Duration::from_secs(7 * 24 * 3600)).await;
        assert!(jobs.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn past_due_one_shots_survive_a_racing_reconcile() {
        let clock = Arc::new(ManualClock::new(at(1, 9, 0)));
        let jobs = Arc::new(RecordingJobs::default());
        let sched = scheduler(config(), clock.clone(), jobs.clone());
        sched.reconcile(&[week10()]).await.unwrap();

        // wall clock reached selection end before the timer woke
        clock.set(at(3, 18, 0));
        let report = sched.reconcile(&[week10()]).await.unwrap();
        assert!(report.cancelled.is_empty());
        assert!(sched.installed().await.contains_key("autoselect_1"));

        tokio::time::sleep(Duration::from_secs(57 * 3600 + 1)).await;
        assert!(jobs.calls().contains(&JobKind::AutoSelect(1)));
        assert!(sched.installed().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_runs_every_day() {
        let clock = Arc::new(ManualClock::new(at(1, 9, 0)));
        let jobs = Arc::new(RecordingJobs::default());
        let sched = scheduler(SchedulerConfig { cleanup_enabled: true, ..config() }, clock, jobs.clone());
        sched.reconcile(&[]).await.unwrap();

        // first run at 2025-03-02 02:00
        tokio::time::sleep(Duration::from_secs(17 * 3600 + 1)).await;
        assert_eq!(jobs.calls(), vec![JobKind::Cleanup]);
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(jobs.calls(), vec![JobKind::Cleanup, JobKind::Cleanup]);
        assert!(sched.installed().await.contains_key("cleanup"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_jobs_are_logged_not_raised() {
        let clock = Arc::new(ManualClock::new(at(1, 9, 0)));
        let jobs = Arc::new(RecordingJobs::failing());
        let sched = scheduler(config(), clock, jobs.clone());
        sched.reconcile(&[week10()]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(51 * 3600 + 1)).await;
        assert_eq!(jobs.calls(), vec![JobKind::Reminder(1)]);
        assert!(sched.logs().iter().any(|l| l.contains("job reminder_1 run #1 failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_running_jobs_within_grace() {
        let clock = Arc::new(ManualClock::new(at(3, 11, 59)));
        let jobs = Arc::new(RecordingJobs::slow(Duration::from_secs(30)));
        let sched = scheduler(config(), clock, jobs.clone());
        sched.reconcile(&[week10()]).await.unwrap();

        // reminder fires at 12:00 and runs for 30 s
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(jobs.calls(), vec![JobKind::Reminder(1)]);

        assert!(!sched.shutdown(Duration::from_secs(5)).await);
        assert!(sched.installed().await.is_empty());
        assert!(sched.shutdown(Duration::from_secs(60)).await);

        // nothing fires after shutdown
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(jobs.calls(), vec![JobKind::Reminder(1)]);
        assert_eq!(sched.reconcile(&[week10()]).await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn catalog_changes_trigger_reconciliation() {
        let db = TestDb::new().await;
        let jobs = Arc::new(RecordingJobs::default());
        let sched = Scheduler::new(config(), db.clock.clone(), db.ids.clone(), jobs, db.log.clone());
        let report = sched.start(db.catalog.clone()).await.unwrap();
        assert_eq!(report, ReconcileReport::default());

        let meal = db.week_meal().await;
        let key = JobKind::AutoSelect(meal.id).key();
        let mut seen = false;
        for _ in 0..200 {
            if sched.installed().await.contains_key(&key) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "auto-select job never installed");

        db.catalog.delete(meal.id).await.unwrap();
        for _ in 0..200 {
            if sched.installed().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sched.installed().await.is_empty());

        let draft = meal_draft("Week 11", at(8, 8, 0), at(10, 18, 0), at(11, 0, 0), at(17, 23, 59));
        assert!(sched.shutdown(Duration::from_secs(1)).await);
        db.catalog.create(&draft).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sched.installed().await.is_empty());
    }
}
