use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::store::Store;

/// Synthetic device id under which every metric is aggregated.
pub const GLOBAL_DEVICE_ID: &str = "__global__";

/// Append/update counters keyed by (device_id, metric).
///
/// Every write touches the device row and the `__global__` row inside one
/// transaction, so the aggregate can never drift from the per-device rows.
#[derive(Clone)]
pub struct StatsRecorder {
    pool: SqlitePool,
}

impl StatsRecorder {
    pub fn new(store: &Store) -> Self {
        StatsRecorder {
            pool: store.pool().clone(),
        }
    }

    pub async fn increment(&self, device_id: &str, metric: &str, amount: f64) -> Result<()> {
        let device_id = normalize_device_id(device_id);
        let mut tx = self.pool.begin().await?;
        upsert_add(&mut tx, device_id, metric, amount).await?;
        if device_id != GLOBAL_DEVICE_ID {
            upsert_add(&mut tx, GLOBAL_DEVICE_ID, metric, amount).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set(&self, device_id: &str, metric: &str, value: f64) -> Result<()> {
        let device_id = normalize_device_id(device_id);
        let mut tx = self.pool.begin().await?;
        upsert_replace(&mut tx, device_id, metric, value).await?;
        if device_id != GLOBAL_DEVICE_ID {
            upsert_replace(&mut tx, GLOBAL_DEVICE_ID, metric, value).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_video_started(&self, device_id: &str) -> Result<()> {
        self.increment(device_id, "videos_watched", 1.0).await
    }

    pub async fn record_watch_time(&self, device_id: &str, seconds: f64) -> Result<()> {
        if seconds <= 0.0 {
            return Ok(());
        }
        self.increment(device_id, "watch_time_seconds", seconds).await
    }

    pub async fn record_segment_skip(
        &self,
        device_id: &str,
        count: usize,
        saved_seconds: f64,
        categories: &[String],
    ) -> Result<()> {
        if count > 0 {
            self.increment(device_id, "segments_skipped", count as f64)
                .await?;
        }
        if saved_seconds > 0.0 {
            self.increment(device_id, "time_saved_seconds", saved_seconds)
                .await?;
        }
        if !categories.is_empty() {
            let per_category = saved_seconds / categories.len() as f64;
            for category in categories {
                self.increment(device_id, &format!("skip_category_{category}"), 1.0)
                    .await?;
                if saved_seconds > 0.0 {
                    self.increment(
                        device_id,
                        &format!("time_saved_category_{category}"),
                        per_category,
                    )
                    .await?;
                }
            }
        }
        self.mark_device_seen(device_id).await
    }

    pub async fn mark_device_seen(&self, device_id: &str) -> Result<()> {
        self.set(device_id, "last_seen", unix_now()).await
    }

    /// Point-in-time read of every row, keyed device -> metric -> value.
    pub async fn snapshot(&self) -> Result<HashMap<String, HashMap<String, f64>>> {
        let rows = sqlx::query("SELECT device_id, metric, value FROM stats")
            .fetch_all(&self.pool)
            .await?;
        let mut map: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for row in rows {
            map.entry(row.get("device_id"))
                .or_default()
                .insert(row.get("metric"), row.get("value"));
        }
        Ok(map)
    }
}

async fn upsert_add(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    device_id: &str,
    metric: &str,
    amount: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stats(device_id, metric, value) VALUES(?, ?, ?)
        ON CONFLICT(device_id, metric) DO UPDATE SET value = value + excluded.value
        "#,
    )
    .bind(device_id)
    .bind(metric)
    .bind(amount)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_replace(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    device_id: &str,
    metric: &str,
    value: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stats(device_id, metric, value) VALUES(?, ?, ?)
        ON CONFLICT(device_id, metric) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(device_id)
    .bind(metric)
    .bind(value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn normalize_device_id(device_id: &str) -> &str {
    if device_id.is_empty() {
        GLOBAL_DEVICE_ID
    } else {
        device_id
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
