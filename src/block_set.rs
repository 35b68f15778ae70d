use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockedTarget {
    pub identifier: String,
    pub display_name: String,
    pub blocked: bool,
}

impl BlockedTarget {
    pub fn new(identifier: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
            blocked: true,
        }
    }
}

type Members = HashMap<String, BlockedTarget>;

/// Shared set of blocked application identifiers.
///
/// Writers build a complete map and swap it in under a short write lock;
/// readers clone the current `Arc` and never see a half-applied list.
#[derive(Clone, Default)]
pub struct BlockSet {
    members: Arc<RwLock<Arc<Members>>>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole membership. Targets with `blocked == false` are
    /// dropped; a repeated identifier keeps its last entry.
    pub fn replace(&self, targets: Vec<BlockedTarget>) {
        let next: Members = targets
            .into_iter()
            .filter(|target| target.blocked)
            .map(|target| (target.identifier.clone(), target))
            .collect();
        let count = next.len();

        {
            let mut guard = match self.members.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Arc::new(next);
        }

        info!("Block set replaced: {count} apps");
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.snapshot().contains_key(identifier)
    }

    pub fn get(&self, identifier: &str) -> Option<BlockedTarget> {
        self.snapshot().get(identifier).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Current membership, sorted by identifier.
    pub fn targets(&self) -> Vec<BlockedTarget> {
        let mut targets: Vec<BlockedTarget> = self.snapshot().values().cloned().collect();
        targets.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        targets
    }

    fn snapshot(&self) -> Arc<Members> {
        let guard = match self.members.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }
}

/// Display name derived from an identifier when no better name is known:
/// the last non-empty `.` or `/` separated segment.
pub fn derive_display_name(identifier: &str) -> String {
    identifier
        .rsplit(|c| c == '.' || c == '/' || c == '\\')
        .find(|segment| !segment.trim().is_empty())
        .map(|segment| segment.trim().to_string())
        .unwrap_or_else(|| identifier.to_string())
}
