use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::usage::UsageReport;

use super::model::Settings;
use super::prompts::PromptKind;

/// The settings service, keyed by user identifier. Besides settings it
/// takes usage backups and serves the short texts shown on the gate.
#[async_trait]
pub trait SettingsRemote: Send + Sync {
    async fn fetch_settings(&self, user_id: &str) -> Result<Settings>;

    /// Store `settings` remotely and return what the store now holds.
    async fn save_settings(&self, user_id: &str, settings: &Settings) -> Result<Settings>;

    async fn backup_usage(&self, _user_id: &str, _report: &UsageReport) -> Result<()> {
        bail!("usage backup is not supported by this remote")
    }

    async fn fetch_prompt(&self, kind: PromptKind) -> Result<String> {
        bail!("{:?} is not supported by this remote", kind)
    }
}

/// Remote used when no settings service is configured. Every call fails,
/// so the bridge serves the local cache and keeps saves pending.
pub struct OfflineRemote;

const OFFLINE: &str = "no remote settings service configured";

#[async_trait]
impl SettingsRemote for OfflineRemote {
    async fn fetch_settings(&self, _user_id: &str) -> Result<Settings> {
        bail!(OFFLINE)
    }

    async fn save_settings(&self, _user_id: &str, _settings: &Settings) -> Result<Settings> {
        bail!(OFFLINE)
    }

    async fn backup_usage(&self, _user_id: &str, _report: &UsageReport) -> Result<()> {
        bail!(OFFLINE)
    }

    async fn fetch_prompt(&self, _kind: PromptKind) -> Result<String> {
        bail!(OFFLINE)
    }
}
