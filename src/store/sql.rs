//! sqlx-backed repository. Uses the `Any` driver so the same code serves
//! MySQL and SQLite DSNs. Timestamps are stored in the wire's
//! `yyyy-MM-dd HH:mm:ss` text form, which keeps comparisons portable
//! across dialects.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

use crate::common::error::Result;
use crate::protocol::FACE_BACKUP_NUM;
use crate::store::{within_debounce, FaceRow, Repository, UserSummary, MIN_ENROLL_ID};

pub struct SqlRepository {
    pool: AnyPool,
}

impl SqlRepository {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(8)
            .connect(connection_string)
            .await?;

        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                enroll_id BIGINT NOT NULL,
                backup_num BIGINT NOT NULL,
                name TEXT NOT NULL,
                is_admin BIGINT NOT NULL DEFAULT 0,
                record TEXT,
                is_active BIGINT NOT NULL DEFAULT 1,
                PRIMARY KEY (enroll_id, backup_num)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS attendance (
                enroll_id BIGINT NOT NULL,
                device_serial TEXT NOT NULL,
                punch_time TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS id_alloc (
                last_id BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM id_alloc")
            .fetch_one(&self.pool)
            .await?;
        if rows == 0 {
            sqlx::query("INSERT INTO id_alloc (last_id) VALUES (?)")
                .bind(MIN_ENROLL_ID - 1)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Repository for SqlRepository {
    async fn has_face_data(&self, enroll_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users
             WHERE enroll_id = ? AND backup_num = ? AND record IS NOT NULL AND record <> ''",
        )
        .bind(enroll_id)
        .bind(FACE_BACKUP_NUM as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn upsert_user(
        &self,
        enroll_id: i64,
        name: &str,
        backup_num: i32,
        is_admin: bool,
        record: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Preserve the active flag across template refreshes
        let is_active: i64 = sqlx::query_scalar(
            "SELECT is_active FROM users WHERE enroll_id = ? AND backup_num = ?",
        )
        .bind(enroll_id)
        .bind(backup_num as i64)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(1);

        sqlx::query("DELETE FROM users WHERE enroll_id = ? AND backup_num = ?")
            .bind(enroll_id)
            .bind(backup_num as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO users (enroll_id, backup_num, name, is_admin, record, is_active)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(enroll_id)
        .bind(backup_num as i64)
        .bind(name)
        .bind(is_admin as i64)
        .bind(record)
        .bind(is_active)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_user(&self, enroll_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE enroll_id = ?")
            .bind(enroll_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_user_active(&self, enroll_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_active = ? WHERE enroll_id = ?")
            .bind(active as i64)
            .bind(enroll_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log_attendance(&self, enroll_id: i64, device_serial: &str, time: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<String> = sqlx::query_scalar(
            "SELECT punch_time FROM attendance
             WHERE enroll_id = ? ORDER BY punch_time DESC LIMIT 1",
        )
        .bind(enroll_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(previous) = previous {
            if within_debounce(&previous, time) {
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO attendance (enroll_id, device_serial, punch_time) VALUES (?, ?, ?)",
        )
        .bind(enroll_id)
        .bind(device_serial)
        .bind(time)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn search_users_by_name(&self, fragment: &str) -> Result<Vec<UserSummary>> {
        let pattern = format!("%{}%", fragment.to_lowercase());
        let rows = sqlx::query(
            "SELECT DISTINCT enroll_id, name, is_active FROM users
             WHERE LOWER(name) LIKE ?",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(UserSummary {
                enroll_id: row.try_get::<i64, _>("enroll_id")?,
                name: row.try_get::<String, _>("name")?,
                is_active: row.try_get::<i64, _>("is_active")? != 0,
            });
        }
        Ok(results)
    }

    async fn next_enroll_id(&self) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        // The UPDATE takes the row lock first, serializing concurrent
        // allocations on every backend the Any driver speaks.
        sqlx::query("UPDATE id_alloc SET last_id = last_id + 1")
            .execute(&mut *tx)
            .await?;

        let allocated: i64 = sqlx::query_scalar("SELECT last_id FROM id_alloc")
            .fetch_one(&mut *tx)
            .await?;

        let max_existing: Option<i64> = sqlx::query_scalar("SELECT MAX(enroll_id) FROM users")
            .fetch_one(&mut *tx)
            .await?;

        let next = allocated
            .max(max_existing.unwrap_or(0) + 1)
            .max(MIN_ENROLL_ID);
        if next != allocated {
            sqlx::query("UPDATE id_alloc SET last_id = ?")
                .bind(next)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(next)
    }

    async fn snapshot_active_face_users(&self) -> Result<HashMap<i64, bool>> {
        let rows = sqlx::query(
            "SELECT enroll_id, is_active FROM users
             WHERE backup_num = ? AND record IS NOT NULL AND record <> ''",
        )
        .bind(FACE_BACKUP_NUM as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = HashMap::with_capacity(rows.len());
        for row in rows {
            snapshot.insert(
                row.try_get::<i64, _>("enroll_id")?,
                row.try_get::<i64, _>("is_active")? != 0,
            );
        }
        Ok(snapshot)
    }

    async fn fetch_face_row(&self, enroll_id: i64) -> Result<Option<FaceRow>> {
        let row = sqlx::query(
            "SELECT name, record, is_active FROM users
             WHERE enroll_id = ? AND backup_num = ? AND record IS NOT NULL AND record <> ''",
        )
        .bind(enroll_id)
        .bind(FACE_BACKUP_NUM as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(FaceRow {
                name: row.try_get::<String, _>("name")?,
                record: row.try_get::<String, _>("record")?,
                is_active: row.try_get::<i64, _>("is_active")? != 0,
            })),
            None => Ok(None),
        }
    }
}
