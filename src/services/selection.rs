use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use rand::Rng;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::{
    clock::Clock,
    db::{begin_write, retry::with_retry},
    error::{Error, Result},
    models::{
        meal::Meal,
        selection::{MealBreakdown, Selection, Variant, VariantCounts},
    },
    services::{catalog::MealCatalog, students::StudentService},
};

const SELECT_RETRY_BASE: Duration = Duration::from_millis(200);
const BULK_RETRY_BASE: Duration = Duration::from_millis(300);

/// Per-(student, meal) A/B choices.
#[derive(Clone)]
pub struct SelectionEngine {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    catalog: MealCatalog,
    /// Meals already auto-filled, keyed to the selection end they were
    /// filled at. Student writes stay closed until that end moves.
    sealed: Arc<Mutex<HashMap<i64, NaiveDateTime>>>,
}

impl SelectionEngine {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, catalog: MealCatalog) -> Self {
        Self { pool, clock, catalog, sealed: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Creates or overwrites the student's choice for a meal.
    ///
    /// With `require_window`, the call fails unless the selection window is
    /// open and the meal has not yet been auto-filled.
    pub async fn select(
        &self,
        student_id: i64,
        meal_id: i64,
        variant: Variant,
        require_window: bool,
    ) -> Result<Selection> {
        let meal = self.catalog.get(meal_id).await?;
        StudentService::get(&self.pool, student_id).await?;

        if require_window {
            self.check_open(&meal)?;
        }

        let meal = &meal;
        with_retry("select meal", SELECT_RETRY_BASE, move || async move {
            let mut tx = begin_write(&self.pool).await?;
            // An auto fill may have committed while this call waited for the lock.
            if require_window {
                self.check_open(meal)?;
            }
            let selection = upsert(&mut tx, student_id, meal_id, variant).await?;
            tx.commit().await?;
            Ok::<_, Error>(selection)
        })
        .await
    }

    /// Admin write for many students at once, ignoring the window.
    ///
    /// Unknown students and rows that fail are skipped. Returns how many
    /// rows were written.
    pub async fn bulk_select(&self, student_ids: &[i64], meal_id: i64, variant: Variant) -> Result<u64> {
        self.catalog.get(meal_id).await?;

        let written = with_retry("bulk select", BULK_RETRY_BASE, move || async move {
            let mut tx = begin_write(&self.pool).await?;
            let mut written = 0u64;
            for &student_id in student_ids {
                match StudentService::find(&mut *tx, student_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => continue,
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        warn!("bulk select: lookup of student {student_id} failed: {e}");
                        continue;
                    }
                }
                match upsert(&mut tx, student_id, meal_id, variant).await {
                    Ok(_) => written += 1,
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => warn!("bulk select: student {student_id} skipped: {e}"),
                }
            }
            tx.commit().await?;
            Ok::<_, Error>(written)
        })
        .await?;

        info!("bulk select: {written} row(s) set to {variant} for meal {meal_id}");
        Ok(written)
    }

    /// Gives every student without a choice for `meal_id` a balanced random
    /// variant, in a single transaction. Returns the number of rows filled.
    pub async fn auto_fill(&self, meal_id: i64) -> Result<u64> {
        let meal = self.catalog.get(meal_id).await?;
        // Close the window before reading so that a racing student write
        // either committed already or is refused.
        self.seal(&meal);

        let filled = with_retry("auto fill", SELECT_RETRY_BASE, move || async move {
            let mut tx = begin_write(&self.pool).await?;
            let students = StudentService::list_ids(&mut *tx).await?;
            let existing = sqlx::query_as::<_, (i64, String)>(
                "SELECT student_id, variant FROM meal_selections WHERE meal_id = ?1",
            )
            .bind(meal_id)
            .fetch_all(&mut *tx)
            .await?;

            let mut counts = VariantCounts::default();
            let mut chosen = HashSet::with_capacity(existing.len());
            for (student_id, variant) in existing {
                counts.bump(variant.parse()?);
                chosen.insert(student_id);
            }
            let missing: Vec<i64> = students.into_iter().filter(|id| !chosen.contains(id)).collect();
            let picks = balanced_picks(&mut counts, missing.len(), &mut rand::thread_rng());

            for (&student_id, &variant) in missing.iter().zip(&picks) {
                sqlx::query(
                    "INSERT INTO meal_selections (student_id, meal_id, variant) VALUES (?1, ?2, ?3)",
                )
                .bind(student_id)
                .bind(meal_id)
                .bind(variant.as_str())
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<_, Error>(picks.len() as u64)
        })
        .await?;

        info!("auto fill: {filled} student(s) assigned for meal {meal_id}");
        Ok(filled)
    }

    /// The student's choice for the cycle collectible right now.
    pub async fn active_selection(&self, student_id: i64) -> Result<Option<Selection>> {
        let Some(meal) = self.catalog.effective_at(self.clock.now()).await? else {
            return Ok(None);
        };
        find(&self.pool, student_id, meal.id).await
    }

    pub async fn list_by_meal(&self, meal_id: i64) -> Result<Vec<Selection>> {
        let rows = sqlx::query_as::<_, Selection>(
            "SELECT * FROM meal_selections WHERE meal_id = ?1 ORDER BY student_id",
        )
        .bind(meal_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_by_student(&self, student_id: i64) -> Result<Vec<Selection>> {
        let rows = sqlx::query_as::<_, Selection>(
            "SELECT * FROM meal_selections WHERE student_id = ?1 ORDER BY meal_id",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn counts(&self, meal_id: i64) -> Result<VariantCounts> {
        let (a, b) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(SUM(variant = 'A'), 0), COALESCE(SUM(variant = 'B'), 0)
             FROM meal_selections WHERE meal_id = ?1",
        )
        .bind(meal_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(VariantCounts { a, b })
    }

    /// Student ids grouped by choice, with everyone who has not chosen.
    pub async fn breakdown(&self, meal_id: i64) -> Result<MealBreakdown> {
        self.catalog.get(meal_id).await?;
        let rows = sqlx::query_as::<_, (i64, Option<String>)>(
            "SELECT s.id, ms.variant FROM students s
             LEFT JOIN meal_selections ms ON ms.student_id = s.id AND ms.meal_id = ?1
             ORDER BY s.id",
        )
        .bind(meal_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = MealBreakdown::default();
        for (student_id, variant) in rows {
            match variant.as_deref().map(str::parse::<Variant>).transpose()? {
                Some(Variant::A) => out.a.push(student_id),
                Some(Variant::B) => out.b.push(student_id),
                None => out.unselected.push(student_id),
            }
        }
        Ok(out)
    }

    fn check_open(&self, meal: &Meal) -> Result<()> {
        if !meal.is_selectable_at(self.clock.now()) {
            return Err(Error::validation(format!("selection for meal {} is not open", meal.id)));
        }
        if self.is_sealed(meal) {
            return Err(Error::validation(format!("selection for meal {} has closed", meal.id)));
        }
        Ok(())
    }

    fn seal(&self, meal: &Meal) {
        let mut sealed = self.sealed.lock().unwrap_or_else(|e| e.into_inner());
        sealed.insert(meal.id, meal.selection_end);
    }

    fn is_sealed(&self, meal: &Meal) -> bool {
        let sealed = self.sealed.lock().unwrap_or_else(|e| e.into_inner());
        sealed.get(&meal.id) == Some(&meal.selection_end)
    }
}

async fn find(pool: &SqlitePool, student_id: i64, meal_id: i64) -> Result<Option<Selection>> {
    let row = sqlx::query_as::<_, Selection>(
        "SELECT * FROM meal_selections WHERE student_id = ?1 AND meal_id = ?2",
    )
    .bind(student_id)
    .bind(meal_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Insert or overwrite on the (student, meal) key.
async fn upsert(
    conn: &mut SqliteConnection,
    student_id: i64,
    meal_id: i64,
    variant: Variant,
) -> Result<Selection> {
    let row = sqlx::query_as::<_, Selection>(
        "INSERT INTO meal_selections (student_id, meal_id, variant)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (student_id, meal_id) DO UPDATE SET variant = excluded.variant
         RETURNING *",
    )
    .bind(student_id)
    .bind(meal_id)
    .bind(variant.as_str())
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

/// Variants for `n` students. The first pick is uniform; each later pick
/// goes to whichever variant has fewer rows so far, ties broken at random.
fn balanced_picks<R: Rng>(counts: &mut VariantCounts, n: usize, rng: &mut R) -> Vec<Variant> {
    let mut picks = Vec::with_capacity(n);
    for i in 0..n {
        let coin = if rng.gen_bool(0.5) { Variant::A } else { Variant::B };
        let v = if i == 0 { coin } else { counts.minority().unwrap_or(coin) };
        counts.bump(v);
        picks.push(v);
    }
    picks
}
