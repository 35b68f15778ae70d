use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

// One year; longer session durations are clamped.
const MAX_GRANT_SECS: u64 = 366 * 24 * 60 * 60;

/// Time-limited passes handed out when the user opens a target anyway.
/// While a pass is live, focusing the target does not open another gate.
#[derive(Clone, Default)]
pub struct AccessGrants {
    expires: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl AccessGrants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `identifier` through for `duration_secs` starting at `from`.
    /// A zero duration grants nothing.
    pub fn grant(
        &self,
        identifier: &str,
        from: DateTime<Utc>,
        duration_secs: u64,
    ) -> Option<DateTime<Utc>> {
        if duration_secs == 0 {
            return None;
        }
        let secs = duration_secs.min(MAX_GRANT_SECS) as i64;
        let until = from + Duration::seconds(secs);
        self.lock().insert(identifier.to_string(), until);
        Some(until)
    }

    /// Whether `identifier` holds a pass at `at`. Expired passes are dropped.
    pub fn is_granted(&self, identifier: &str, at: DateTime<Utc>) -> bool {
        let mut expires = self.lock();
        expires.retain(|_, until| *until > at);
        expires.contains_key(identifier)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        match self.expires.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
