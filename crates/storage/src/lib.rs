use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{SubmissionId, SubmissionSummary};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub form_id: String,
    pub name: String,
    pub email: String,
    pub subject: Option<String>,
    pub message: String,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own database, so the
        // pool is pinned to one long-lived connection.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn insert_submission(&self, submission: &NewSubmission) -> Result<SubmissionId> {
        let rec = sqlx::query(
            "INSERT INTO form_submissions (form_id, name, email, subject, message, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&submission.form_id)
        .bind(&submission.name)
        .bind(&submission.email)
        .bind(submission.subject.as_deref())
        .bind(&submission.message)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert form submission")?;
        Ok(SubmissionId(rec.get::<i64, _>(0)))
    }

    pub async fn load_submission(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Option<SubmissionSummary>> {
        let row = sqlx::query(
            "SELECT id, form_id, name, email, subject, message, created_at
             FROM form_submissions WHERE id = ?",
        )
        .bind(submission_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(submission_from_row).transpose()
    }

    /// Newest first.
    pub async fn list_submissions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SubmissionSummary>> {
        let rows = sqlx::query(
            "SELECT id, form_id, name, email, subject, message, created_at
             FROM form_submissions
             ORDER BY id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(submission_from_row).collect()
    }

    pub async fn count_submissions(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM form_submissions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn submission_from_row(row: &SqliteRow) -> Result<SubmissionSummary> {
    Ok(SubmissionSummary {
        submission_id: SubmissionId(row.try_get::<i64, _>("id")?),
        form_id: row.try_get("form_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        subject: row.try_get("subject")?,
        message: row.try_get("message")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
