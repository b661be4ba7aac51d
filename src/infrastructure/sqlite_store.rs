use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::application::{AppError, AppResult, SeenSet, WatchStore};
use crate::domain::{NewWatch, Platform, SortOrder, UserId, Watch, WatchId};

fn storage(e: sqlx::Error) -> AppError {
    AppError::Storage(e.to_string())
}

/// Watches and seen records in one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    max_active_per_user: usize,
}

type WatchRow = (
    i64,
    i64,
    String,
    String,
    Option<f64>,
    Option<i64>,
    String,
    i64,
    Option<i64>,
    bool,
);

const WATCH_COLUMNS: &str =
    "id, user_id, platform, query, max_price, max_minutes, sort, created_at, expires_at, active";

impl SqliteStore {
    /// db_url examples
    /// - "sqlite:/data/zenwatch.db"
    /// - "sqlite:./zenwatch.db"
    pub async fn new(db_url: &str, max_active_per_user: usize) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(storage)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(storage)?;
        Self::with_pool(pool, max_active_per_user).await
    }

    /// Private in-memory database; a single connection so every query sees the same data.
    pub async fn new_in_memory(max_active_per_user: usize) -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;
        Self::with_pool(pool, max_active_per_user).await
    }

    async fn with_pool(pool: SqlitePool, max_active_per_user: usize) -> AppResult<Self> {
        let store = Self {
            pool,
            max_active_per_user,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watches (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL,
              platform TEXT NOT NULL,
              query TEXT NOT NULL,
              max_price REAL,
              max_minutes INTEGER,
              sort TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              expires_at INTEGER,
              active INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS watches_user_active ON watches(user_id, active, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        // seen: one row per (watch, listing) already notified
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen (
              watch_id INTEGER NOT NULL,
              listing_id TEXT NOT NULL,
              seen_at INTEGER NOT NULL,
              PRIMARY KEY (watch_id, listing_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> AppResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AppError::Storage(format!("timestamp out of range: {ms}")))
}

fn watch_from_row(row: WatchRow) -> AppResult<Watch> {
    let (id, user, platform, query, max_price, max_minutes, sort, created_at, expires_at, active) =
        row;
    let platform = Platform::from_str(&platform).map_err(|e| AppError::Storage(e.to_string()))?;
    let sort = SortOrder::from_str(&sort).map_err(AppError::Storage)?;
    let max_minutes = max_minutes
        .map(u32::try_from)
        .transpose()
        .map_err(|e| AppError::Storage(format!("bad max_minutes: {e}")))?;
    Ok(Watch {
        id: WatchId(id as u64),
        user: UserId(user),
        platform,
        query,
        max_price,
        max_minutes,
        sort,
        created_at: from_millis(created_at)?,
        expires_at: expires_at.map(from_millis).transpose()?,
        active,
    })
}

#[async_trait]
impl WatchStore for SqliteStore {
    async fn create(&self, mut new: NewWatch) -> AppResult<Watch> {
        new.validate()?;
        // stored at millisecond precision; return what `get` will read back
        new.expires_at = new
            .expires_at
            .map(|t| from_millis(to_millis(t)))
            .transpose()?;
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM watches WHERE user_id = ? AND active = 1")
                .bind(new.user.0)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage)?;
        if count as usize >= self.max_active_per_user {
            return Err(AppError::QuotaExceeded {
                limit: self.max_active_per_user,
            });
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO watches(
              user_id, platform, query, max_price, max_minutes, sort, created_at, expires_at, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(new.user.0)
        .bind(new.platform.as_str())
        .bind(&new.query)
        .bind(new.max_price)
        .bind(new.max_minutes.map(i64::from))
        .bind(new.sort.as_str())
        .bind(to_millis(created_at))
        .bind(new.expires_at.map(to_millis))
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        let id = WatchId(result.last_insert_rowid() as u64);
        let created_at = from_millis(to_millis(created_at))?;
        Ok(new.into_watch(id, created_at))
    }

    async fn list(&self, user: UserId) -> AppResult<Vec<Watch>> {
        let rows: Vec<WatchRow> = sqlx::query_as(&format!(
            "SELECT {WATCH_COLUMNS} FROM watches WHERE user_id = ? AND active = 1 ORDER BY created_at, id"
        ))
        .bind(user.0)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(watch_from_row).collect()
    }

    async fn deactivate(&self, user: UserId, index: usize) -> AppResult<Watch> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let row: Option<WatchRow> = sqlx::query_as(&format!(
            "SELECT {WATCH_COLUMNS} FROM watches WHERE user_id = ? AND active = 1 \
             ORDER BY created_at, id LIMIT 1 OFFSET ?"
        ))
        .bind(user.0)
        .bind(index as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;
        let Some(row) = row else {
            return Err(AppError::NotFound(format!(
                "watch #{} for user {user}",
                index + 1
            )));
        };
        let mut watch = watch_from_row(row)?;

        sqlx::query("UPDATE watches SET active = 0 WHERE id = ?")
            .bind(watch.id.0 as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        watch.active = false;
        Ok(watch)
    }

    async fn deactivate_by_id(&self, id: WatchId) -> AppResult<bool> {
        let result = sqlx::query("UPDATE watches SET active = 0 WHERE id = ? AND active = 1")
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: WatchId) -> AppResult<Option<Watch>> {
        let row: Option<WatchRow> =
            sqlx::query_as(&format!("SELECT {WATCH_COLUMNS} FROM watches WHERE id = ?"))
                .bind(id.0 as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        row.map(watch_from_row).transpose()
    }

    async fn all_active(&self) -> AppResult<Vec<Watch>> {
        let rows: Vec<WatchRow> = sqlx::query_as(&format!(
            "SELECT {WATCH_COLUMNS} FROM watches WHERE active = 1 ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(watch_from_row).collect()
    }
}

#[async_trait]
impl SeenSet for SqliteStore {
    async fn has_seen(&self, watch: WatchId, listing_id: &str) -> AppResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM seen WHERE watch_id = ? AND listing_id = ? LIMIT 1")
                .bind(watch.0 as i64)
                .bind(listing_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(row.is_some())
    }

    async fn mark_seen(&self, watch: WatchId, listing_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("INSERT OR IGNORE INTO seen(watch_id, listing_id, seen_at) VALUES(?, ?, ?)")
            .bind(watch.0 as i64)
            .bind(listing_id)
            .bind(to_millis(at))
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn evict_older_than(&self, watch: WatchId, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM seen WHERE watch_id = ? AND seen_at < ?")
            .bind(watch.0 as i64)
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn evict_over_capacity(&self, watch: WatchId, keep: usize) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM seen
            WHERE watch_id = ?1 AND listing_id NOT IN (
              SELECT listing_id FROM seen
              WHERE watch_id = ?1
              ORDER BY seen_at DESC, listing_id DESC
              LIMIT ?2
            )
            "#,
        )
        .bind(watch.0 as i64)
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn forget(&self, watch: WatchId) -> AppResult<()> {
        sqlx::query("DELETE FROM seen WHERE watch_id = ?")
            .bind(watch.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}
