use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::block_set::BlockedTarget;
use crate::db::{helpers::parse_datetime, models::CachedSettings, Database};
use crate::settings::Settings;

use super::blocked_apps;

struct SettingsRow {
    pause_time: String,
    custom_message: String,
    daily_opens: String,
    session_duration: String,
    pending_sync: bool,
    updated_at: String,
}

impl Database {
    /// The cached settings, with `selected_apps` rebuilt from the blocked
    /// app table. `None` until something has been cached.
    pub async fn load_settings(&self) -> Result<Option<CachedSettings>> {
        self.execute(|conn| {
            let row = conn
                .query_row(
                    "SELECT pause_time, custom_message, daily_opens, session_duration,
                            pending_sync, updated_at
                     FROM settings
                     WHERE id = 1",
                    [],
                    |row| {
                        let pending: i64 = row.get("pending_sync")?;
                        Ok(SettingsRow {
                            pause_time: row.get("pause_time")?,
                            custom_message: row.get("custom_message")?,
                            daily_opens: row.get("daily_opens")?,
                            session_duration: row.get("session_duration")?,
                            pending_sync: pending != 0,
                            updated_at: row.get("updated_at")?,
                        })
                    },
                )
                .optional()
                .context("failed to read cached settings")?;

            let Some(row) = row else {
                return Ok(None);
            };

            let selected_apps = blocked_apps::list_blocked(conn)?
                .into_iter()
                .map(|target| target.identifier)
                .collect();

            Ok(Some(CachedSettings {
                settings: Settings {
                    selected_apps,
                    custom_message: row.custom_message,
                    pause_time: row.pause_time,
                    daily_opens: row.daily_opens,
                    session_duration: row.session_duration,
                },
                pending_sync: row.pending_sync,
                updated_at: parse_datetime(&row.updated_at, "updated_at")?,
            }))
        })
        .await
    }

    /// Write the settings row and the blocked app list in one transaction.
    pub async fn store_settings(
        &self,
        settings: &Settings,
        targets: Vec<BlockedTarget>,
        pending_sync: bool,
    ) -> Result<()> {
        let record = settings.clone();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open settings transaction")?;

            tx.execute(
                "INSERT INTO settings (id, pause_time, custom_message, daily_opens, session_duration, pending_sync, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     pause_time = excluded.pause_time,
                     custom_message = excluded.custom_message,
                     daily_opens = excluded.daily_opens,
                     session_duration = excluded.session_duration,
                     pending_sync = excluded.pending_sync,
                     updated_at = excluded.updated_at",
                params![
                    record.pause_time,
                    record.custom_message,
                    record.daily_opens,
                    record.session_duration,
                    i64::from(pending_sync),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("failed to upsert settings")?;

            blocked_apps::replace_all(&tx, &targets)?;

            tx.commit().context("failed to commit settings")?;
            Ok(())
        })
        .await
    }

    pub async fn mark_settings_synced(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute("UPDATE settings SET pending_sync = 0 WHERE id = 1", [])
                .context("failed to clear pending_sync")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Settings {
        Settings {
            selected_apps: vec!["com.instagram.android".into()],
            custom_message: "Respira".into(),
            pause_time: "5 minutos".into(),
            daily_opens: "2".into(),
            session_duration: "15 minutos".into(),
        }
    }

    #[tokio::test]
    async fn test_empty_cache_loads_none() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("cache.sqlite3")).unwrap();
        assert!(db.load_settings().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("cache.sqlite3")).unwrap();

        db.store_settings(
            &sample(),
            vec![BlockedTarget::new("com.instagram.android", "Instagram")],
            true,
        )
        .await
        .unwrap();

        let cached = db.load_settings().await.unwrap().unwrap();
        assert_eq!(cached.settings, sample());
        assert!(cached.pending_sync);

        db.mark_settings_synced().await.unwrap();
        let cached = db.load_settings().await.unwrap().unwrap();
        assert!(!cached.pending_sync);
    }

    #[tokio::test]
    async fn test_cache_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.sqlite3");
        {
            let db = Database::new(path.clone()).unwrap();
            db.store_settings(&sample(), Vec::new(), false).await.unwrap();
        }

        let db = Database::new(path).unwrap();
        let cached = db.load_settings().await.unwrap().unwrap();
        assert_eq!(cached.settings.pause_time, "5 minutos");
        assert!(cached.settings.selected_apps.is_empty());
    }
}
