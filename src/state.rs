use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;

use crate::{
    clock::{Clock, IdGen, SequentialIds},
    config::Config,
    error::Result,
    models::selection::Variant,
    services::{
        activity_log::ActivityLog,
        catalog::MealCatalog,
        collection::CollectionRecorder,
        dingtalk::DingTalkClient,
        directory::DirectoryClient,
        identity::IdentityService,
        mapping::MappingRebuilder,
        notifications::{Notifier, ReminderService},
        scheduler::{CanteenJobs, Scheduler},
        selection::SelectionEngine,
        tasks::TaskQueue,
        token::TokenCipher,
    },
};

/// Background tasks allowed to run at once.
const BACKGROUND_TASKS: usize = 4;

/// Every long-lived component, wired once at startup and shared by clone.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub tokens: TokenCipher,
    pub catalog: MealCatalog,
    pub selections: SelectionEngine,
    pub recorder: CollectionRecorder,
    pub reminders: ReminderService,
    pub identity: IdentityService,
    pub mapping: MappingRebuilder,
    pub scheduler: Scheduler,
    pub tasks: TaskQueue,
    pub log: ActivityLog,
}

impl AppState {
    /// Wires the components against DingTalk.
    pub fn build(config: Arc<Config>, pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        let dingtalk = Arc::new(DingTalkClient::new(config.dingtalk.clone())?);
        if !dingtalk.is_configured() {
            info!("DingTalk credentials not set; directory and notifications will fail");
        }
        Self::with_collaborators(config, pool, clock, dingtalk.clone(), dingtalk)
    }

    pub fn with_collaborators(
        config: Arc<Config>,
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn DirectoryClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let ids: Arc<dyn IdGen> = Arc::new(SequentialIds::default());
        let log = ActivityLog::new(clock.clone());
        let tokens = TokenCipher::from_config_key(&config.token_key)?;

        let catalog = MealCatalog::new(pool.clone(), clock.clone(), config.image_dir.clone());
        let selections = SelectionEngine::new(pool.clone(), clock.clone(), catalog.clone());
        let recorder =
            CollectionRecorder::new(pool.clone(), clock.clone(), tokens.clone(), selections.clone());
        let reminders = ReminderService::new(
            pool.clone(),
            clock.clone(),
            catalog.clone(),
            notifier,
            config.site_url.clone(),
        );
        let identity = IdentityService::new(pool.clone(), directory.clone());
        let mapping = MappingRebuilder::new(pool.clone(), directory, ids.clone(), log.clone());

        let jobs = Arc::new(CanteenJobs {
            catalog: catalog.clone(),
            selections: selections.clone(),
            reminders: reminders.clone(),
        });
        let scheduler = Scheduler::new(config.scheduler.clone(), clock.clone(), ids, jobs, log.clone());

        Ok(Self {
            pool,
            config,
            clock,
            tokens,
            catalog,
            selections,
            recorder,
            reminders,
            identity,
            mapping,
            scheduler,
            tasks: TaskQueue::new(BACKGROUND_TASKS),
            log,
        })
    }

    /// Admin bulk selection. When anything was written, the affected
    /// students and their guardians are told in the background.
    pub async fn bulk_select_and_notify(
        &self,
        student_ids: &[i64],
        meal_id: i64,
        variant: Variant,
    ) -> Result<u64> {
        let written = self.selections.bulk_select(student_ids, meal_id, variant).await?;
        if written > 0 {
            let reminders = self.reminders.clone();
            let ids = student_ids.to_vec();
            self.tasks.spawn(format!("bulk notice for meal {meal_id}"), async move {
                reminders.notify_bulk_selected(meal_id, &ids, variant).await.map(|_| ())
            });
        }
        Ok(written)
    }

    /// Queues a guardian mapping rebuild; `Busy` if one is already running.
    pub fn start_mapping_rebuild(&self) -> Result<()> {
        self.mapping.start(&self.tasks)
    }
}
