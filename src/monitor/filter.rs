use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::block_set::{derive_display_name, BlockSet};
use crate::gate::AccessGrants;
use crate::log_debug;

use super::debounce::EventDebouncer;

const ENABLE_LOGS: bool = true;

/// A foreground change reported by the platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FocusEvent {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
}

impl FocusEvent {
    pub fn now(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDecision {
    pub identifier: String,
    pub display_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    OwnApp,
    SystemSurface,
    NotBlocked,
    /// Blocked, but the user opened it anyway and the pass is still live.
    Granted,
    Duplicate,
    Blocked(BlockDecision),
}

#[derive(Debug, Clone)]
pub struct MonitorRules {
    pub own_identifier: String,
    pub system_identifiers: Vec<String>,
    pub system_prefixes: Vec<String>,
    pub debounce_window: chrono::Duration,
}

impl MonitorRules {
    pub fn is_system_surface(&self, identifier: &str) -> bool {
        self.system_identifiers.iter().any(|id| id == identifier)
            || self
                .system_prefixes
                .iter()
                .any(|prefix| identifier.starts_with(prefix.as_str()))
    }
}

/// Turns raw foreground changes into block decisions.
pub struct ForegroundMonitor {
    rules: MonitorRules,
    block_set: BlockSet,
    grants: AccessGrants,
    debouncer: Mutex<EventDebouncer>,
}

impl ForegroundMonitor {
    pub fn new(rules: MonitorRules, block_set: BlockSet, grants: AccessGrants) -> Self {
        let debouncer = EventDebouncer::new(rules.debounce_window);
        Self {
            rules,
            block_set,
            grants,
            debouncer: Mutex::new(debouncer),
        }
    }

    /// Ignored and granted identifiers never reach the debouncer, so they
    /// cannot reset its record.
    pub fn evaluate(&self, event: &FocusEvent) -> FilterVerdict {
        let identifier = event.identifier.as_str();

        if identifier.is_empty() || identifier == self.rules.own_identifier {
            return FilterVerdict::OwnApp;
        }
        if self.rules.is_system_surface(identifier) {
            log_debug!("Ignoring system surface {}", identifier);
            return FilterVerdict::SystemSurface;
        }
        let Some(target) = self.block_set.get(identifier) else {
            return FilterVerdict::NotBlocked;
        };
        if self.grants.is_granted(identifier, event.timestamp) {
            log_debug!("{} was opened anyway, letting it through", identifier);
            return FilterVerdict::Granted;
        }

        let accepted = {
            let mut debouncer = match self.debouncer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            debouncer.should_trigger(identifier, event.timestamp)
        };
        if !accepted {
            log_debug!("Debounced repeat focus of {}", identifier);
            return FilterVerdict::Duplicate;
        }

        let display_name = if target.display_name.trim().is_empty() {
            derive_display_name(identifier)
        } else {
            target.display_name
        };
        log_debug!("Blocked app in foreground: {} ({})", display_name, identifier);

        FilterVerdict::Blocked(BlockDecision {
            identifier: identifier.to_string(),
            display_name,
            timestamp: event.timestamp,
        })
    }
}
