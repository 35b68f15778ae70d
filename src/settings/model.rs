use serde::{Deserialize, Serialize};

use super::duration::{parse_count, parse_duration_secs};

pub const DEFAULT_PAUSE_TIME: &str = "30 segundos";
pub const DEFAULT_MESSAGE: &str = "Mantén el enfoque. Esta app estará disponible en un momento.";
pub const DEFAULT_DAILY_OPENS: &str = "3";
pub const DEFAULT_SESSION_DURATION: &str = "10 minutos";
const DEFAULT_DAILY_OPEN_LIMIT: u32 = 3;

/// Settings snapshot, as exchanged with the settings service and cached
/// locally. Durations stay in their human-readable form; parsing happens
/// where they are consumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub selected_apps: Vec<String>,
    pub custom_message: String,
    pub pause_time: String,
    pub daily_opens: String,
    pub session_duration: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selected_apps: Vec::new(),
            custom_message: DEFAULT_MESSAGE.into(),
            pause_time: DEFAULT_PAUSE_TIME.into(),
            daily_opens: DEFAULT_DAILY_OPENS.into(),
            session_duration: DEFAULT_SESSION_DURATION.into(),
        }
    }
}

impl Settings {
    pub fn cooldown_secs(&self) -> u64 {
        parse_duration_secs(&self.pause_time)
    }

    pub fn session_duration_secs(&self) -> u64 {
        parse_duration_secs(&self.session_duration)
    }

    pub fn daily_open_limit(&self) -> u32 {
        parse_count(&self.daily_opens).unwrap_or(DEFAULT_DAILY_OPEN_LIMIT)
    }

    pub fn message(&self) -> &str {
        if self.custom_message.trim().is_empty() {
            DEFAULT_MESSAGE
        } else {
            &self.custom_message
        }
    }

    /// Fill blank fields from `fallback`. The settings service may answer
    /// with empty strings for fields the user never touched.
    pub fn with_fallbacks(mut self, fallback: &Settings) -> Self {
        fn keep_or(value: &mut String, fallback: &str) {
            if value.trim().is_empty() {
                *value = fallback.to_string();
            }
        }

        keep_or(&mut self.custom_message, &fallback.custom_message);
        keep_or(&mut self.pause_time, &fallback.pause_time);
        keep_or(&mut self.daily_opens, &fallback.daily_opens);
        keep_or(&mut self.session_duration, &fallback.session_duration);
        self
    }
}
