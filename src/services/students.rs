use chrono::NaiveDate;
use rand::Rng;
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::info;

use crate::{
    db::begin_write,
    error::{Error, Result},
    models::student::{NewStudent, Student, StudentUpdate, UNLINKED},
};

const USERNAME_ATTEMPTS: usize = 5;

pub struct StudentService;

impl StudentService {
    pub async fn create(pool: &SqlitePool, req: &NewStudent) -> Result<Student> {
        let full_name = req.full_name.trim();
        if full_name.is_empty() {
            return Err(Error::validation("student name must not be empty"));
        }

        let username = unique_username(pool, full_name, generate_username).await?;

        let external_id = normalize_external_id(req.external_id.as_deref());
        let student = sqlx::query_as::<_, Student>(
            "INSERT INTO students (username, full_name, class, external_id)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING *",
        )
        .bind(&username)
        .bind(full_name)
        .bind(req.class.trim())
        .bind(&external_id)
        .fetch_one(pool)
        .await?;

        info!("created student {} ({})", student.id, student.username);
        Ok(student)
    }

    pub async fn find<'e, E: SqliteExecutor<'e>>(db: E, id: i64) -> Result<Option<Student>> {
        let student = sqlx::query_as::<_, Student>("SELECT * FROM students WHERE id = ?1")
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(student)
    }

    pub async fn get<'e, E: SqliteExecutor<'e>>(db: E, id: i64) -> Result<Student> {
        Self::find(db, id)
            .await?
            .ok_or_else(|| Error::not_found(format!("student {id}")))
    }

    pub async fn get_by_username(pool: &SqlitePool, username: &str) -> Result<Option<Student>> {
        let student = sqlx::query_as::<_, Student>("SELECT * FROM students WHERE username = ?1")
            .bind(username)
            .fetch_optional(pool)
            .await?;
        Ok(student)
    }

    pub async fn find_by_external_id(pool: &SqlitePool, external_id: &str) -> Result<Option<Student>> {
        if external_id.trim().is_empty() || external_id == UNLINKED {
            return Ok(None);
        }
        let student = sqlx::query_as::<_, Student>(
            "SELECT * FROM students WHERE external_id = ?1 ORDER BY id LIMIT 1",
        )
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
        Ok(student)
    }

    pub async fn list<'e, E: SqliteExecutor<'e>>(db: E) -> Result<Vec<Student>> {
        let students =
            sqlx::query_as::<_, Student>("SELECT * FROM students ORDER BY class, full_name, id")
                .fetch_all(db)
                .await?;
        Ok(students)
    }

    pub async fn list_ids<'e, E: SqliteExecutor<'e>>(db: E) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM students ORDER BY id")
            .fetch_all(db)
            .await?;
        Ok(ids)
    }

    pub async fn update(pool: &SqlitePool, id: i64, req: &StudentUpdate) -> Result<Student> {
        if matches!(req.full_name.as_deref(), Some(n) if n.trim().is_empty()) {
            return Err(Error::validation("student name must not be empty"));
        }
        let external_id = req
            .external_id
            .as_deref()
            .map(|e| normalize_external_id(Some(e)));

        sqlx::query_as::<_, Student>(
            "UPDATE students
             SET full_name   = COALESCE(?1, full_name),
                 class       = COALESCE(?2, class),
                 external_id = COALESCE(?3, external_id)
             WHERE id = ?4
             RETURNING *",
        )
        .bind(req.full_name.as_deref().map(str::trim))
        .bind(req.class.as_deref().map(str::trim))
        .bind(external_id)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("student {id}")))
    }

    /// Removes the student together with every selection they made.
    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
        let mut tx = begin_write(pool).await?;
        sqlx::query("DELETE FROM meal_selections WHERE student_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM students WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("student {id}")));
        }
        tx.commit().await?;
        info!("deleted student {id}");
        Ok(())
    }

    /// Moves the collection day to `today` only if it still holds `observed`.
    ///
    /// Returns whether this call won the update. Two concurrent scans that
    /// both observed the same value advance it exactly once.
    pub async fn advance_collection_day(
        pool: &SqlitePool,
        id: i64,
        observed: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<bool> {
        if matches!(observed, Some(day) if day >= today) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE students SET last_collection_date = ?1
             WHERE id = ?2 AND last_collection_date IS ?3",
        )
        .bind(today)
        .bind(id)
        .bind(observed)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn normalize_external_id(ext: Option<&str>) -> String {
    match ext.map(str::trim) {
        Some(e) if !e.is_empty() => e.to_string(),
        _ => UNLINKED.to_string(),
    }
}

/// Draws candidates from `generate` until one is not taken yet.
async fn unique_username(
    pool: &SqlitePool,
    full_name: &str,
    mut generate: impl FnMut(&str) -> String,
) -> Result<String> {
    for _ in 0..USERNAME_ATTEMPTS {
        let candidate = generate(full_name);
        if StudentService::get_by_username(pool, &candidate).await?.is_none() {
            return Ok(candidate);
        }
    }
    Err(Error::Conflict(format!(
        "no free username for '{full_name}' after {USERNAME_ATTEMPTS} attempts"
    )))
}

/// `stu` + initials + 8 random digits.
///
/// Latin words contribute their first letter; other scripts contribute every
/// character, since each one is a syllable of the name.
pub fn generate_username(full_name: &str) -> String {
    let mut initials = String::new();
    for word in full_name.split_whitespace() {
        if word.is_ascii() {
            if let Some(c) = word.chars().find(|c| c.is_ascii_alphanumeric()) {
                initials.push(c.to_ascii_lowercase());
            }
        } else {
            initials.extend(word.chars().filter(|c| c.is_alphanumeric()).flat_map(char::to_lowercase));
        }
    }
    let digits: u32 = rand::thread_rng().gen_range(10_000_000..100_000_000);
    format!("stu{initials}{digits}")
}
