use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    db::{begin_write, retry::with_retry},
    error::{Error, Result},
    models::meal::{Meal, MealDraft},
};

const WRITE_RETRY_BASE: Duration = Duration::from_millis(200);
/// Events a slow subscriber may fall behind by before it sees `Lagged`.
const EVENT_CAPACITY: usize = 64;

/// Emitted after a catalog write commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogEvent {
    Created(i64),
    Updated(i64),
    Deleted(i64),
    /// Expired cycles were purged.
    Cleaned(usize),
}

/// Meal cycles and their window rules.
#[derive(Clone)]
pub struct MealCatalog {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    image_dir: PathBuf,
    events: broadcast::Sender<CatalogEvent>,
}

impl MealCatalog {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, image_dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { pool, clock, image_dir: image_dir.into(), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    pub async fn create(&self, draft: &MealDraft) -> Result<Meal> {
        let meal = with_retry("create meal", WRITE_RETRY_BASE, move || self.insert_once(draft)).await?;
        info!("meal {} '{}' created", meal.id, meal.name);
        self.emit(CatalogEvent::Created(meal.id));
        Ok(meal)
    }

    pub async fn update(&self, id: i64, draft: &MealDraft) -> Result<Meal> {
        let (meal, old_image) =
            with_retry("update meal", WRITE_RETRY_BASE, move || self.update_once(id, draft)).await?;
        if !old_image.is_empty() && old_image != meal.image_ref {
            self.remove_image(&old_image).await;
        }
        info!("meal {} '{}' updated", meal.id, meal.name);
        self.emit(CatalogEvent::Updated(meal.id));
        Ok(meal)
    }

    /// Deletes the cycle and its selections; the image goes after commit.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let image = with_retry("delete meal", WRITE_RETRY_BASE, move || self.delete_once(id)).await?;
        if !image.is_empty() {
            self.remove_image(&image).await;
        }
        info!("meal {id} deleted");
        self.emit(CatalogEvent::Deleted(id));
        Ok(())
    }

    pub async fn find(&self, id: i64) -> Result<Option<Meal>> {
        let meal = sqlx::query_as::<_, Meal>("SELECT * FROM meals WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(meal)
    }

    pub async fn get(&self, id: i64) -> Result<Meal> {
        self.find(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("meal {id}")))
    }

    pub async fn list_all(&self) -> Result<Vec<Meal>> {
        let meals = sqlx::query_as::<_, Meal>("SELECT * FROM meals ORDER BY effective_start, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(meals)
    }

    pub async fn list_selectable(&self) -> Result<Vec<Meal>> {
        let now = self.clock.now();
        let meals = sqlx::query_as::<_, Meal>(
            "SELECT * FROM meals
             WHERE selection_start <= ?1 AND selection_end >= ?1
             ORDER BY effective_start, id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(meals)
    }

    /// The cycle collectible at `at`, if any. Effective windows never
    /// overlap, so there is at most one.
    pub async fn effective_at(&self, at: NaiveDateTime) -> Result<Option<Meal>> {
        let meal = sqlx::query_as::<_, Meal>(
            "SELECT * FROM meals
             WHERE effective_start <= ?1 AND effective_end >= ?1
             ORDER BY effective_start
             LIMIT 1",
        )
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(meal)
    }

    /// Deletes every cycle whose effective window has ended.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let images = with_retry("cleanup expired meals", WRITE_RETRY_BASE, move || {
            self.cleanup_once(now)
        })
        .await?;

        let removed = images.len();
        for image in images.iter().filter(|i| !i.is_empty()) {
            self.remove_image(image).await;
        }
        if removed > 0 {
            info!("cleaned up {removed} expired meal(s)");
            self.emit(CatalogEvent::Cleaned(removed));
        }
        Ok(removed)
    }

    async fn insert_once(&self, draft: &MealDraft) -> Result<Meal> {
        let mut tx = begin_write(&self.pool).await?;
        self.revalidate(&mut tx, None, draft).await?;
        let meal = sqlx::query_as::<_, Meal>(
            "INSERT INTO meals (name, selection_start, selection_end, effective_start, effective_end, image_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING *",
        )
        .bind(draft.name.trim())
        .bind(draft.selection_start)
        .bind(draft.selection_end)
        .bind(draft.effective_start)
        .bind(draft.effective_end)
        .bind(&draft.image_ref)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(meal)
    }

    async fn update_once(&self, id: i64, draft: &MealDraft) -> Result<(Meal, String)> {
        let mut tx = begin_write(&self.pool).await?;
        let old_image = sqlx::query_scalar::<_, String>("SELECT image_path FROM meals WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found(format!("meal {id}")))?;
        self.revalidate(&mut tx, Some(id), draft).await?;
        let meal = sqlx::query_as::<_, Meal>(
            "UPDATE meals
             SET name = ?1, selection_start = ?2, selection_end = ?3,
                 effective_start = ?4, effective_end = ?5, image_path = ?6
             WHERE id = ?7
             RETURNING *",
        )
        .bind(draft.name.trim())
        .bind(draft.selection_start)
        .bind(draft.selection_end)
        .bind(draft.effective_start)
        .bind(draft.effective_end)
        .bind(&draft.image_ref)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((meal, old_image))
    }

    async fn delete_once(&self, id: i64) -> Result<String> {
        let mut tx = begin_write(&self.pool).await?;
        let image = sqlx::query_scalar::<_, String>("SELECT image_path FROM meals WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found(format!("meal {id}")))?;
        sqlx::query("DELETE FROM meal_selections WHERE meal_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM meals WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(image)
    }

    /// Returns the image refs of the deleted rows.
    async fn cleanup_once(&self, now: NaiveDateTime) -> Result<Vec<String>> {
        let mut tx = begin_write(&self.pool).await?;
        let expired = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, image_path FROM meals WHERE effective_end < ?1",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        for (id, _) in &expired {
            sqlx::query("DELETE FROM meal_selections WHERE meal_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM meals WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(expired.into_iter().map(|(_, image)| image).collect())
    }

    /// Window rules plus the cross-row overlap check, run inside the write
    /// transaction so a concurrent writer cannot slip an overlapping cycle in.
    async fn revalidate(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        id: Option<i64>,
        draft: &MealDraft,
    ) -> Result<()> {
        draft.validate_windows(self.clock.now())?;
        if !draft.image_ref.is_empty() && self.image_path(&draft.image_ref).is_none() {
            return Err(Error::validation("image reference must be a relative path"));
        }

        let overlapping = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM meals
             WHERE id != ?1 AND effective_start <= ?3 AND effective_end >= ?2",
        )
        .bind(id.unwrap_or(0))
        .bind(draft.effective_start)
        .bind(draft.effective_end)
        .fetch_one(&mut **tx)
        .await?;
        if overlapping > 0 {
            return Err(Error::validation(
                "effective window overlaps another meal cycle",
            ));
        }
        Ok(())
    }

    fn image_path(&self, image_ref: &str) -> Option<PathBuf> {
        let rel = Path::new(image_ref.trim_start_matches('/'));
        if rel.components().all(|c| matches!(c, Component::Normal(_))) {
            Some(self.image_dir.join(rel))
        } else {
            None
        }
    }

    async fn remove_image(&self, image_ref: &str) {
        let Some(path) = self.image_path(image_ref) else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("removed meal image {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove meal image {}: {e}", path.display()),
        }
    }

    fn emit(&self, event: CatalogEvent) {
        // No subscriber is fine: the scheduler may be disabled.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::selection::Variant;
    use crate::testing::{at, meal_draft, TestDb};
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn create_emits_and_lists_by_effective_start() {
        let db = TestDb::new().await;
        let mut rx = db.catalog.subscribe();

        let later = db
            .catalog
            .create(&meal_draft("Week 11", at(8, 8, 0), at(10, 18, 0), at(11, 0, 0), at(17, 23, 59)))
            .await
            .unwrap();
        let earlier = db
            .catalog
            .create(&meal_draft("Week 10", at(1, 8, 0), at(3, 18, 0), at(4, 0, 0), at(10, 23, 59)))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), CatalogEvent::Created(later.id));
        assert_eq!(rx.recv().await.unwrap(), CatalogEvent::Created(earlier.id));

        let ids: Vec<i64> = db.catalog.list_all().await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
    }

    #[tokio::test]
    async fn subscribers_that_fall_behind_see_lagged() {
        let db = TestDb::new().await;
        let mut rx = db.catalog.subscribe();
        for i in 0..=EVENT_CAPACITY {
            db.catalog.emit(CatalogEvent::Cleaned(i));
        }
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(1))));
        assert_eq!(rx.recv().await.unwrap(), CatalogEvent::Cleaned(1));
    }

    #[tokio::test]
    async fn overlapping_effective_windows_are_rejected() {
        let db = TestDb::new().await;
        db.catalog
            .create(&meal_draft("Week 10", at(1, 8, 0), at(3, 18, 0), at(4, 0, 0), at(10, 23, 59)))
            .await
            .unwrap();

        // touching the closed interval at a single instant is an overlap
        let err = db
            .catalog
            .create(&meal_draft("Clash", at(5, 8, 0), at(9, 18, 0), at(10, 23, 59), at(12, 0, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(db.catalog.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_excludes_itself_from_overlap_check() {
        let db = TestDb::new().await;
        let meal = db.week_meal().await;

        let mut draft = meal_draft(
            "Week 10 (extended)",
            meal.selection_start,
            meal.selection_end,
            meal.effective_start,
            meal.effective_end + ChronoDuration::days(1),
        );
        let updated = db.catalog.update(meal.id, &draft).await.unwrap();
        assert_eq!(updated.name, "Week 10 (extended)");

        draft.effective_start = draft.selection_end;
        assert!(matches!(db.catalog.update(meal.id, &draft).await, Err(Error::Validation(_))));
        assert!(matches!(db.catalog.update(9999, &draft).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_cascades_and_unlinks_image() {
        let db = TestDb::new().await;
        let image = db.image_dir.path().join("week10.jpg");
        std::fs::write(&image, b"jpeg").unwrap();

        let mut draft = meal_draft("Week 10", at(1, 8, 0), at(3, 18, 0), at(4, 0, 0), at(10, 23, 59));
        draft.image_ref = "week10.jpg".into();
        let meal = db.catalog.create(&draft).await.unwrap();
        let s = db.student("Li Lei", "1-1", None).await;
        db.pick(s.id, meal.id, Variant::B).await;

        db.catalog.delete(meal.id).await.unwrap();
        assert!(!image.exists());
        assert!(db.catalog.find(meal.id).await.unwrap().is_none());
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meal_selections")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(left, 0);
        assert!(matches!(db.catalog.delete(meal.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn traversal_in_image_ref_is_rejected() {
        let db = TestDb::new().await;
        let mut draft = meal_draft("Week 10", at(1, 8, 0), at(3, 18, 0), at(4, 0, 0), at(10, 23, 59));
        draft.image_ref = "../etc/passwd".into();
        assert!(matches!(db.catalog.create(&draft).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_cycles() {
        let db = TestDb::new().await;
        let old = db
            .catalog
            .create(&meal_draft("Old", at(1, 8, 0), at(2, 18, 0), at(3, 0, 0), at(4, 23, 59)))
            .await
            .unwrap();
        let current = db
            .catalog
            .create(&meal_draft("Current", at(3, 8, 0), at(5, 18, 0), at(6, 0, 0), at(12, 23, 59)))
            .await
            .unwrap();

        db.clock.set(at(5, 0, 0));
        let mut rx = db.catalog.subscribe();
        assert_eq!(db.catalog.cleanup_expired().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), CatalogEvent::Cleaned(1));
        assert!(db.catalog.find(old.id).await.unwrap().is_none());
        assert!(db.catalog.find(current.id).await.unwrap().is_some());

        // nothing left to do, nothing emitted
        assert_eq!(db.catalog.cleanup_expired().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn selectable_bounds_are_inclusive() {
        let db = TestDb::new().await;
        let meal = db.week_meal().await;

        db.clock.set(meal.selection_end);
        assert_eq!(db.catalog.list_selectable().await.unwrap().len(), 1);
        db.clock.set(meal.selection_end + ChronoDuration::seconds(1));
        assert!(db.catalog.list_selectable().await.unwrap().is_empty());
        db.clock.set(meal.selection_start);
        assert_eq!(db.catalog.list_selectable().await.unwrap().len(), 1);
    }
}
