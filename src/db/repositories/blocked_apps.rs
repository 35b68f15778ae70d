use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};

use crate::block_set::BlockedTarget;
use crate::db::Database;

fn row_to_target(row: &Row) -> Result<BlockedTarget, rusqlite::Error> {
    let is_blocked: i64 = row.get("is_blocked")?;
    Ok(BlockedTarget {
        identifier: row.get("identifier")?,
        display_name: row.get("display_name")?,
        blocked: is_blocked != 0,
    })
}

/// Delete-all then insert. Callers run this inside a transaction.
pub(crate) fn replace_all(conn: &Connection, targets: &[BlockedTarget]) -> Result<()> {
    conn.execute("DELETE FROM blocked_apps", [])
        .context("failed to clear blocked_apps")?;

    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO blocked_apps (identifier, display_name, is_blocked)
         VALUES (?1, ?2, ?3)",
    )?;
    for target in targets {
        stmt.execute(params![
            target.identifier,
            target.display_name,
            i64::from(target.blocked),
        ])
        .with_context(|| format!("failed to insert blocked app {}", target.identifier))?;
    }
    Ok(())
}

pub(crate) fn list_blocked(conn: &Connection) -> Result<Vec<BlockedTarget>> {
    let mut stmt = conn.prepare(
        "SELECT identifier, display_name, is_blocked
         FROM blocked_apps
         WHERE is_blocked = 1
         ORDER BY identifier",
    )?;
    let targets = stmt
        .query_map([], row_to_target)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(targets)
}

impl Database {
    pub async fn list_blocked_apps(&self) -> Result<Vec<BlockedTarget>> {
        self.execute(|conn| list_blocked(conn)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_store_is_a_full_swap() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("cache.sqlite3")).unwrap();
        let settings = Settings::default();

        db.store_settings(
            &settings,
            vec![
                BlockedTarget::new("com.instagram.android", "Instagram"),
                BlockedTarget::new("com.reddit.frontpage", "Reddit"),
            ],
            false,
        )
        .await
        .unwrap();
        db.store_settings(
            &settings,
            vec![BlockedTarget::new("com.reddit.frontpage", "Reddit")],
            false,
        )
        .await
        .unwrap();

        let apps = db.list_blocked_apps().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].identifier, "com.reddit.frontpage");
    }

    #[tokio::test]
    async fn test_unblocked_rows_are_not_listed() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("cache.sqlite3")).unwrap();

        let mut paused = BlockedTarget::new("com.twitter.android", "X");
        paused.blocked = false;
        db.store_settings(
            &Settings::default(),
            vec![paused, BlockedTarget::new("com.reddit.frontpage", "Reddit")],
            false,
        )
        .await
        .unwrap();

        let apps = db.list_blocked_apps().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].identifier, "com.reddit.frontpage");
        let cached = db.load_settings().await.unwrap().unwrap();
        assert_eq!(cached.settings.selected_apps, vec!["com.reddit.frontpage"]);
    }
}
