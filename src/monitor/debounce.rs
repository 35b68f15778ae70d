use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_DEBOUNCE_MS: i64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DebounceRecord {
    identifier: String,
    accepted_at: DateTime<Utc>,
}

/// Suppresses repeat foreground reports for the same application.
///
/// Only the most recently accepted identifier is remembered, so switching
/// A -> B -> A inside the window still lets the second A through.
#[derive(Debug, Clone)]
pub struct EventDebouncer {
    window: Duration,
    last: Option<DebounceRecord>,
}

impl EventDebouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns true and records `identifier` unless it repeats the last
    /// accepted identifier within the window. A timestamp earlier than the
    /// recorded one counts as inside the window.
    pub fn should_trigger(&mut self, identifier: &str, now: DateTime<Utc>) -> bool {
        if let Some(last) = &self.last {
            let elapsed = now.signed_duration_since(last.accepted_at);
            if last.identifier == identifier && elapsed < self.window {
                return false;
            }
        }

        self.last = Some(DebounceRecord {
            identifier: identifier.to_string(),
            accepted_at: now,
        });
        true
    }
}

impl Default for EventDebouncer {
    fn default() -> Self {
        Self::new(Duration::milliseconds(DEFAULT_DEBOUNCE_MS))
    }
}
