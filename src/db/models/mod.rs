use chrono::{DateTime, Utc};

use crate::settings::Settings;

/// The cached settings row together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSettings {
    pub settings: Settings,
    pub pending_sync: bool,
    pub updated_at: DateTime<Utc>,
}
