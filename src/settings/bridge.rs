use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::block_set::{derive_display_name, BlockSet, BlockedTarget};
use crate::catalog::{name_index, AppCatalog};
use crate::db::Database;

use super::model::Settings;
use super::remote::SettingsRemote;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RefreshOutcome {
    /// The remote answered and its settings are now current.
    Fresh,
    /// The previous snapshot is still being served.
    Stale { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SaveOutcome {
    Synced,
    /// Saved locally; the remote write will be retried on the next refresh.
    PendingSync { reason: String },
}

/// Keeps the current settings snapshot and the block set in step with the
/// settings service, falling back to the local cache whenever the remote
/// is unavailable.
pub struct SettingsBridge {
    db: Database,
    remote: Arc<dyn SettingsRemote>,
    catalog: Arc<dyn AppCatalog>,
    block_set: BlockSet,
    snapshot: watch::Sender<Arc<Settings>>,
    pending_sync: AtomicBool,
    writer: Mutex<()>,
}

impl SettingsBridge {
    /// Build the bridge from whatever the cache holds; defaults otherwise.
    pub async fn load(
        db: Database,
        remote: Arc<dyn SettingsRemote>,
        catalog: Arc<dyn AppCatalog>,
        block_set: BlockSet,
    ) -> Result<Self> {
        let cached = db
            .load_settings()
            .await
            .context("failed to load cached settings")?;

        let (settings, pending) = match cached {
            Some(cached) => {
                let targets = db.list_blocked_apps().await?;
                info!(
                    "Loaded cached settings from {} ({} blocked apps, pending_sync={})",
                    cached.updated_at.to_rfc3339(),
                    targets.len(),
                    cached.pending_sync
                );
                block_set.replace(targets);
                (
                    cached.settings.with_fallbacks(&Settings::default()),
                    cached.pending_sync,
                )
            }
            None => {
                info!("No cached settings, starting from defaults");
                block_set.replace(Vec::new());
                (Settings::default(), false)
            }
        };

        let (snapshot, _) = watch::channel(Arc::new(settings));

        Ok(Self {
            db,
            remote,
            catalog,
            block_set,
            snapshot,
            pending_sync: AtomicBool::new(pending),
            writer: Mutex::new(()),
        })
    }

    /// Last known good settings. Never blocks on a refresh in flight.
    pub fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.snapshot.subscribe()
    }

    pub fn block_set(&self) -> &BlockSet {
        &self.block_set
    }

    pub fn has_pending_sync(&self) -> bool {
        self.pending_sync.load(Ordering::SeqCst)
    }

    /// Pull settings for `user_id`. Unsynced local changes are pushed
    /// first; while that push fails the remote is not read, so local edits
    /// are never overwritten by an older remote copy.
    pub async fn refresh(&self, user_id: &str) -> RefreshOutcome {
        let _writer = self.writer.lock().await;

        if self.pending_sync.load(Ordering::SeqCst) {
            let local = self.current();
            match self.remote.save_settings(user_id, &local).await {
                Ok(_) => {
                    info!("Pushed pending settings for {user_id}");
                    self.clear_pending().await;
                }
                Err(err) => {
                    warn!("Pending settings push failed, serving local copy: {err:#}");
                    return RefreshOutcome::Stale {
                        reason: format!("{err:#}"),
                    };
                }
            }
        }

        let fetched = match self.remote.fetch_settings(user_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!("Settings fetch failed, serving cached snapshot: {err:#}");
                return RefreshOutcome::Stale {
                    reason: format!("{err:#}"),
                };
            }
        };

        let settings = fetched.with_fallbacks(&Settings::default());
        let targets = self.resolve_targets(&settings.selected_apps).await;

        if let Err(err) = self.db.store_settings(&settings, targets.clone(), false).await {
            warn!("Failed to cache fetched settings: {err:#}");
        }
        self.publish(settings, targets);
        info!("Settings refreshed for {user_id}");
        RefreshOutcome::Fresh
    }

    /// Save locally, then try the remote. A local failure is an error; a
    /// remote failure is not.
    pub async fn save(&self, user_id: &str, settings: Settings) -> Result<SaveOutcome> {
        let _writer = self.writer.lock().await;

        let settings = settings.with_fallbacks(&self.current());
        let targets = self.resolve_targets(&settings.selected_apps).await;

        self.db
            .store_settings(&settings, targets.clone(), true)
            .await
            .context("failed to save settings locally")?;
        self.pending_sync.store(true, Ordering::SeqCst);
        self.publish(settings.clone(), targets);

        match self.remote.save_settings(user_id, &settings).await {
            Ok(_) => {
                self.clear_pending().await;
                info!("Settings saved and synced for {user_id}");
                Ok(SaveOutcome::Synced)
            }
            Err(err) => {
                warn!("Remote settings save failed, kept locally: {err:#}");
                Ok(SaveOutcome::PendingSync {
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    async fn clear_pending(&self) {
        self.pending_sync.store(false, Ordering::SeqCst);
        if let Err(err) = self.db.mark_settings_synced().await {
            warn!("Failed to clear pending_sync flag in cache: {err:#}");
        }
    }

    fn publish(&self, settings: Settings, targets: Vec<BlockedTarget>) {
        self.block_set.replace(targets);
        self.snapshot.send_replace(Arc::new(settings));
    }

    /// Name each selected identifier from the catalog, deriving a name
    /// when the app is unknown.
    async fn resolve_targets(&self, identifiers: &[String]) -> Vec<BlockedTarget> {
        let catalog = Arc::clone(&self.catalog);
        let names = match tokio::task::spawn_blocking(move || catalog.list_installed_applications())
            .await
        {
            Ok(Ok(apps)) => name_index(apps),
            Ok(Err(err)) => {
                warn!("App catalog unavailable, deriving names: {err:#}");
                Default::default()
            }
            Err(err) => {
                warn!("App catalog worker failed, deriving names: {err}");
                Default::default()
            }
        };

        let mut seen = HashSet::new();
        identifiers
            .iter()
            .map(|identifier| identifier.trim())
            .filter(|identifier| !identifier.is_empty() && seen.insert(identifier.to_string()))
            .map(|identifier| {
                let display_name = names
                    .get(identifier)
                    .cloned()
                    .unwrap_or_else(|| derive_display_name(identifier));
                BlockedTarget::new(identifier, display_name)
            })
            .collect()
    }
}
