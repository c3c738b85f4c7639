use rand::Rng;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    models::staff::{NewStaff, Role, Staff, StaffUpdate},
};

const BCRYPT_COST: u32 = 12;
const INVALID_LOGIN: &str = "invalid username or password";

pub struct StaffService;

impl StaffService {
    pub async fn create(pool: &SqlitePool, req: &NewStaff) -> Result<Staff> {
        let username = req.username.trim();
        if username.is_empty() || req.password.is_empty() {
            return Err(Error::validation("username and password are required"));
        }
        if Self::get_by_username(pool, username).await?.is_some() {
            return Err(Error::validation(format!("username {username} is taken")));
        }

        let password_hash = bcrypt::hash(&req.password, BCRYPT_COST)?;
        let staff = sqlx::query_as::<_, Staff>(
            "INSERT INTO staff (username, password_hash, full_name, role, external_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             RETURNING *",
        )
        .bind(username)
        .bind(&password_hash)
        .bind(req.full_name.trim())
        .bind(req.role.as_str())
        .bind(non_empty(req.external_id.as_deref()))
        .fetch_one(pool)
        .await?;

        info!("created staff account {} as {}", staff.username, staff.role);
        Ok(staff)
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<Staff> {
        sqlx::query_as::<_, Staff>("SELECT * FROM staff WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("staff {id}")))
    }

    pub async fn get_by_username(pool: &SqlitePool, username: &str) -> Result<Option<Staff>> {
        let staff = sqlx::query_as::<_, Staff>("SELECT * FROM staff WHERE username = ?1")
            .bind(username)
            .fetch_optional(pool)
            .await?;
        Ok(staff)
    }

    pub async fn find_by_external_id(pool: &SqlitePool, external_id: &str) -> Result<Option<Staff>> {
        let Some(external_id) = non_empty(Some(external_id)) else {
            return Ok(None);
        };
        let staff = sqlx::query_as::<_, Staff>(
            "SELECT * FROM staff WHERE external_id = ?1 ORDER BY id LIMIT 1",
        )
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
        Ok(staff)
    }

    pub async fn list(pool: &SqlitePool, role: Option<Role>) -> Result<Vec<Staff>> {
        let staff = sqlx::query_as::<_, Staff>(
            "SELECT * FROM staff WHERE ?1 IS NULL OR role = ?1 ORDER BY username",
        )
        .bind(role.map(Role::as_str))
        .fetch_all(pool)
        .await?;
        Ok(staff)
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM staff")
            .fetch_one(pool)
            .await?;
        Ok(n)
    }

    pub async fn update(pool: &SqlitePool, id: i64, req: &StaffUpdate) -> Result<Staff> {
        let password_hash = match req.password.as_deref() {
            Some("") => return Err(Error::validation("password must not be empty")),
            Some(p) => Some(bcrypt::hash(p, BCRYPT_COST)?),
            None => None,
        };

        sqlx::query_as::<_, Staff>(
            "UPDATE staff
             SET full_name     = COALESCE(?1, full_name),
                 role          = COALESCE(?2, role),
                 password_hash = COALESCE(?3, password_hash),
                 external_id   = COALESCE(?4, external_id)
             WHERE id = ?5
             RETURNING *",
        )
        .bind(req.full_name.as_deref().map(str::trim))
        .bind(req.role.map(Role::as_str))
        .bind(password_hash)
        .bind(req.external_id.as_deref().map(str::trim))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("staff {id}")))
    }

    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM staff WHERE id = ?1")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("staff {id}")));
        }
        Ok(())
    }

    /// Unknown user and wrong password fail identically.
    pub async fn verify_password(pool: &SqlitePool, username: &str, password: &str) -> Result<Staff> {
        let staff = Self::get_by_username(pool, username.trim())
            .await?
            .ok_or_else(|| Error::validation(INVALID_LOGIN))?;
        let valid = bcrypt::verify(password, &staff.password_hash)
            .map_err(|_| Error::validation(INVALID_LOGIN))?;
        if !valid {
            return Err(Error::validation(INVALID_LOGIN));
        }
        Ok(staff)
    }

    /// Creates `admin` with a random password when no staff exist yet.
    /// Returns the generated password so the caller can show it once.
    pub async fn ensure_initial_admin(pool: &SqlitePool) -> Result<Option<String>> {
        if Self::count(pool).await? > 0 {
            return Ok(None);
        }
        let password: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        Self::create(
            pool,
            &NewStaff {
                username: "admin".into(),
                password: password.clone(),
                full_name: "Administrator".into(),
                role: Role::Admin,
                external_id: None,
            },
        )
        .await?;
        warn!("no staff accounts found; created initial administrator 'admin'");
        Ok(Some(password))
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
