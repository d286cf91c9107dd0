use std::collections::HashMap;
use std::path::Path;

use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool};

use crate::error::Result;
use crate::models::DeviceSnapshot;
use crate::overrides::{ChannelEntry, DeviceOverrides};

/// Global settings snapshot from the `settings` table, plus the two
/// config-level lists. Values are stored JSON-encoded under their key.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub api_key: String,
    pub skip_count_tracking: bool,
    pub mute_ads: bool,
    pub skip_ads: bool,
    pub minimum_skip_length: u32,
    pub auto_play: bool,
    pub join_name: String,
    pub use_proxy: bool,
    pub skip_categories: Vec<String>,
    pub channel_whitelist: Vec<ChannelEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            api_key: String::new(),
            skip_count_tracking: true,
            mute_ads: false,
            skip_ads: false,
            minimum_skip_length: 1,
            auto_play: true,
            join_name: "sbtv".to_string(),
            use_proxy: false,
            skip_categories: Vec::new(),
            channel_whitelist: Vec::new(),
        }
    }
}

/// The durable configuration + stats store at `<data_dir>/config.db`.
///
/// The pool is capped at one connection: writers serialize on it, which is
/// exactly the contract the stats sink needs, and reads are short.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("config.db");
        let url = format!("sqlite://{}", db_path.display());
        Self::connect(&url).await
    }

    /// Connect to an explicit database URL. Tests use `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            Sqlite::create_database(url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        let store = Store { pool };
        store.ensure_tables().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_tables(&self) -> Result<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                screen_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                offset INTEGER NOT NULL DEFAULT 0,
                overrides TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS channel_whitelist (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS skip_categories (
                category TEXT PRIMARY KEY
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS stats (
                device_id TEXT NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (device_id, metric)
            )
            "#,
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Fresh settings snapshot. Callers must not cache between reconciler
    /// ticks; the management surface writes this table concurrently.
    pub async fn load_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::default();

        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            apply_setting(&mut config, &key, &value);
        }

        let rows = sqlx::query("SELECT category FROM skip_categories")
            .fetch_all(&self.pool)
            .await?;
        config.skip_categories = rows
            .into_iter()
            .map(|row| row.get::<String, _>("category"))
            .collect();
        if config.skip_categories.is_empty() {
            config.skip_categories.push("sponsor".to_string());
        }

        let rows =
            sqlx::query("SELECT id, name FROM channel_whitelist ORDER BY name COLLATE NOCASE")
                .fetch_all(&self.pool)
                .await?;
        config.channel_whitelist = rows
            .into_iter()
            .map(|row| ChannelEntry {
                id: row.get("id"),
                name: row.get("name"),
            })
            .collect();

        Ok(config)
    }

    /// The desired device set, keyed by screen id. Rows with a blank
    /// screen id are skipped.
    pub async fn load_device_snapshots(&self) -> Result<HashMap<String, DeviceSnapshot>> {
        let rows = sqlx::query("SELECT screen_id, name, offset, overrides FROM devices")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshots = HashMap::new();
        for row in rows {
            let screen_id: String = row.get("screen_id");
            let screen_id = screen_id.trim().to_string();
            if screen_id.is_empty() {
                continue;
            }
            let name: String = row.get("name");
            let name = if name.is_empty() {
                screen_id.clone()
            } else {
                name
            };
            let offset_ms: i64 = row.get::<i64, _>("offset").max(0);
            let overrides_raw: String = row.get("overrides");
            snapshots.insert(
                screen_id.clone(),
                DeviceSnapshot {
                    screen_id,
                    name,
                    offset_ms,
                    overrides: DeviceOverrides::from_stored(&overrides_raw),
                },
            );
        }
        Ok(snapshots)
    }
}

fn apply_setting(config: &mut AppConfig, key: &str, raw: &str) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(key, error = %err, "ignoring malformed setting");
            return;
        }
    };
    match key {
        "api_key" => {
            if let Some(s) = value.as_str() {
                config.api_key = s.to_string();
            }
        }
        "skip_count_tracking" => {
            if let Some(b) = value.as_bool() {
                config.skip_count_tracking = b;
            }
        }
        "mute_ads" => {
            if let Some(b) = value.as_bool() {
                config.mute_ads = b;
            }
        }
        "skip_ads" => {
            if let Some(b) = value.as_bool() {
                config.skip_ads = b;
            }
        }
        "minimum_skip_length" => {
            if let Some(n) = value.as_u64() {
                config.minimum_skip_length = n as u32;
            }
        }
        "auto_play" => {
            if let Some(b) = value.as_bool() {
                config.auto_play = b;
            }
        }
        "join_name" => {
            if let Some(s) = value.as_str() {
                config.join_name = s.to_string();
            }
        }
        "use_proxy" => {
            if let Some(b) = value.as_bool() {
                config.use_proxy = b;
            }
        }
        _ => tracing::debug!(key, "ignoring unknown setting"),
    }
}
