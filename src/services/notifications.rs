use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    error::{Error, Result},
    models::{
        meal::Meal,
        notification::{ActionCard, NotifyReport},
        selection::Variant,
        student::{is_linked, Student},
    },
    services::{catalog::MealCatalog, guardians::GuardianService, students::StudentService},
};

/// Upstream limit on recipients per push.
pub const MAX_BATCH: usize = 100;
const BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Push channel for work notifications addressed by directory user id.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `recipients` never holds more than [`MAX_BATCH`] ids.
    async fn send(&self, recipients: &[String], card: &ActionCard) -> Result<()>;
}

/// Builds meal cards and pushes them to students and their guardians.
#[derive(Clone)]
pub struct ReminderService {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    catalog: MealCatalog,
    notifier: Arc<dyn Notifier>,
    site_url: String,
}

impl ReminderService {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        catalog: MealCatalog,
        notifier: Arc<dyn Notifier>,
        site_url: impl Into<String>,
    ) -> Self {
        Self { pool, clock, catalog, notifier, site_url: site_url.into() }
    }

    /// Reminds everyone who has not chosen yet. Only valid while the
    /// selection window is open.
    pub async fn notify_unselected(&self, meal_id: i64) -> Result<NotifyReport> {
        let meal = self.catalog.get(meal_id).await?;
        let now = self.clock.now();
        if now < meal.selection_start {
            return Err(Error::validation(format!("selection for meal {meal_id} has not started")));
        }
        if now > meal.selection_end {
            return Err(Error::validation(format!("selection for meal {meal_id} has ended")));
        }

        let chosen: HashSet<i64> = sqlx::query_scalar::<_, i64>(
            "SELECT student_id FROM meal_selections WHERE meal_id = ?1",
        )
        .bind(meal_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();
        let missing: Vec<Student> = StudentService::list(&self.pool)
            .await?
            .into_iter()
            .filter(|s| !chosen.contains(&s.id))
            .collect();
        if missing.is_empty() {
            info!("meal {meal_id}: every student has chosen, no reminder sent");
            return Ok(NotifyReport::default());
        }

        let recipients = self.recipients_for(&missing).await?;
        let card = self.reminder_card(&meal);
        Ok(self.send_batched(&recipients, &card).await)
    }

    /// Tells the given students (and their guardians) which variant an
    /// administrator chose on their behalf.
    pub async fn notify_bulk_selected(
        &self,
        meal_id: i64,
        student_ids: &[i64],
        variant: Variant,
    ) -> Result<NotifyReport> {
        let meal = self.catalog.get(meal_id).await?;
        let mut students = Vec::with_capacity(student_ids.len());
        for &id in student_ids {
            if let Some(s) = StudentService::find(&self.pool, id).await? {
                students.push(s);
            }
        }
        let recipients = self.recipients_for(&students).await?;
        let card = ActionCard {
            title: "Meal selection updated".into(),
            markdown_body: format!(
                "## Meal selection updated\n\nYour choice for **{}** has been set to **meal {}** by the canteen office.",
                meal.name, variant
            ),
            link_label: "View details".into(),
            link_href: self.link(),
        };
        Ok(self.send_batched(&recipients, &card).await)
    }

    /// Directory ids of the students and every guardian linked to them.
    /// Unlinked ids are dropped; duplicates are kept.
    async fn recipients_for(&self, students: &[Student]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for student in students.iter().filter(|s| is_linked(&s.external_id)) {
            out.push(student.external_id.clone());
            let guardians = GuardianService::guardians_of_student(&self.pool, &student.external_id).await?;
            out.extend(guardians.into_iter().filter(|g| is_linked(g)));
        }
        Ok(out)
    }

    fn reminder_card(&self, meal: &Meal) -> ActionCard {
        ActionCard {
            title: "Meal selection reminder".into(),
            markdown_body: format!(
                "## Meal selection reminder\n\nYou have not chosen a meal for **{}** yet.\n\nSelection closes at {}.",
                meal.name,
                meal.selection_end.format("%Y-%m-%d %H:%M:%S")
            ),
            link_label: "View details".into(),
            link_href: self.link(),
        }
    }

    fn link(&self) -> String {
        format!("{}/dingtalk_auth", self.site_url.trim_end_matches('/'))
    }

    async fn send_batched(&self, recipients: &[String], card: &ActionCard) -> NotifyReport {
        let mut report = NotifyReport { recipients: recipients.len(), ..Default::default() };
        if recipients.is_empty() {
            warn!("'{}': no linked recipients to notify", card.title);
            return report;
        }
        for (i, batch) in recipients.chunks(MAX_BATCH).enumerate() {
            if i > 0 {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
            match self.notifier.send(batch, card).await {
                Ok(()) => report.batches_sent += 1,
                Err(e) => {
                    report.batches_failed += 1;
                    warn!("'{}': batch {} of {} recipients failed: {e}", card.title, i + 1, batch.len());
                }
            }
        }
        info!(
            "'{}' pushed to {} recipient(s): {} batch(es) sent, {} failed",
            card.title, report.recipients, report.batches_sent, report.batches_failed
        );
        report
    }
}
