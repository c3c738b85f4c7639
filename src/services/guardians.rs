use sqlx::{SqliteExecutor, SqlitePool};

use crate::{
    db::begin_write,
    error::Result,
    models::{guardian::GuardianLink, student::Student},
};

pub struct GuardianService;

impl GuardianService {
    pub async fn upsert<'e, E: SqliteExecutor<'e>>(
        db: E,
        guardian_ext_id: &str,
        student_ext_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO guardian_links (guardian_ext_id, student_ext_id)
             VALUES (?1, ?2)
             ON CONFLICT (guardian_ext_id, student_ext_id) DO NOTHING",
        )
        .bind(guardian_ext_id)
        .bind(student_ext_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn clear<'e, E: SqliteExecutor<'e>>(db: E) -> Result<u64> {
        let result = sqlx::query("DELETE FROM guardian_links").execute(db).await?;
        Ok(result.rows_affected())
    }

    /// Swap the whole table for `links` in one transaction.
    /// Returns the number of distinct pairs written.
    pub async fn replace_all(pool: &SqlitePool, links: &[GuardianLink]) -> Result<u64> {
        let mut tx = begin_write(pool).await?;
        Self::clear(&mut *tx).await?;
        let mut written = 0;
        for link in links {
            if Self::upsert(&mut *tx, &link.guardian_ext_id, &link.student_ext_id).await? {
                written += 1;
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn students_of_guardian(pool: &SqlitePool, guardian_ext_id: &str) -> Result<Vec<Student>> {
        let students = sqlx::query_as::<_, Student>(
            "SELECT s.* FROM students s
             JOIN guardian_links g ON g.student_ext_id = s.external_id
             WHERE g.guardian_ext_id = ?1
             ORDER BY s.class, s.full_name, s.id",
        )
        .bind(guardian_ext_id)
        .fetch_all(pool)
        .await?;
        Ok(students)
    }

    pub async fn guardians_of_student<'e, E: SqliteExecutor<'e>>(
        db: E,
        student_ext_id: &str,
    ) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT guardian_ext_id FROM guardian_links
             WHERE student_ext_id = ?1
             ORDER BY guardian_ext_id",
        )
        .bind(student_ext_id)
        .fetch_all(db)
        .await?;
        Ok(ids)
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<GuardianLink>> {
        let links = sqlx::query_as::<_, GuardianLink>(
            "SELECT guardian_ext_id, student_ext_id FROM guardian_links
             ORDER BY guardian_ext_id, student_ext_id",
        )
        .fetch_all(pool)
        .await?;
        Ok(links)
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM guardian_links")
            .fetch_one(pool)
            .await?;
        Ok(n)
    }
}
