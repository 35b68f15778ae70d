use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::settings::SettingsRemote;

/// Gate activity since the last successful backup, in the shape the
/// settings service accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub timestamp: Option<DateTime<Utc>>,
    /// Seconds of access granted through "open anyway", all apps.
    pub total_screen_time: u64,
    /// Seconds of access granted per identifier.
    pub apps_used: BTreeMap<String, u64>,
    pub blocks_triggered: u32,
    pub seconds_waited: u64,
}

impl UsageReport {
    pub fn is_empty(&self) -> bool {
        self.blocks_triggered == 0 && self.apps_used.is_empty()
    }

    fn merge(&mut self, other: UsageReport) {
        self.total_screen_time += other.total_screen_time;
        self.blocks_triggered += other.blocks_triggered;
        self.seconds_waited += other.seconds_waited;
        for (identifier, secs) in other.apps_used {
            *self.apps_used.entry(identifier).or_default() += secs;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BackupOutcome {
    #[serde(rename_all = "camelCase")]
    Sent { blocks_triggered: u32 },
    Empty,
    /// Kept locally for the next attempt.
    Deferred { reason: String },
}

/// Accumulates closed gates until they are backed up.
#[derive(Clone, Default)]
pub struct UsageLedger {
    pending: Arc<Mutex<UsageReport>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one closed gate. `granted_secs` is zero unless the user went
    /// through to the app.
    pub fn record_gate(&self, identifier: &str, waited_secs: u64, granted_secs: u64) {
        let mut pending = self.lock();
        pending.blocks_triggered += 1;
        pending.seconds_waited += waited_secs;
        if granted_secs > 0 {
            pending.total_screen_time += granted_secs;
            *pending.apps_used.entry(identifier.to_string()).or_default() += granted_secs;
        }
    }

    pub fn snapshot(&self) -> UsageReport {
        self.lock().clone()
    }

    /// Hand out everything recorded so far, stamped with `at`, and start
    /// over. `None` when there is nothing to report.
    pub fn take(&self, at: DateTime<Utc>) -> Option<UsageReport> {
        let mut pending = self.lock();
        if pending.is_empty() {
            return None;
        }
        let mut report = std::mem::take(&mut *pending);
        report.timestamp = Some(at);
        Some(report)
    }

    /// Put back a report whose backup failed.
    pub fn restore(&self, report: UsageReport) {
        self.lock().merge(report);
    }

    fn lock(&self) -> MutexGuard<'_, UsageReport> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Send pending usage to the settings service. On failure the report goes
/// back into the ledger.
pub async fn backup(
    ledger: &UsageLedger,
    remote: &dyn SettingsRemote,
    user_id: &str,
) -> BackupOutcome {
    let Some(report) = ledger.take(Utc::now()) else {
        return BackupOutcome::Empty;
    };

    match remote.backup_usage(user_id, &report).await {
        Ok(()) => {
            info!(
                "Backed up usage for {user_id}: {} gates, {}s granted",
                report.blocks_triggered, report.total_screen_time
            );
            BackupOutcome::Sent {
                blocks_triggered: report.blocks_triggered,
            }
        }
        Err(err) => {
            warn!("Usage backup failed, keeping it for later: {err:#}");
            ledger.restore(report);
            BackupOutcome::Deferred {
                reason: format!("{err:#}"),
            }
        }
    }
}
