use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::monitor::BlockDecision;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum GatePhase {
    Idle,
    #[serde(rename_all = "camelCase")]
    CountingDown { remaining_secs: u64 },
    Unlocked,
    Closed,
}

impl Default for GatePhase {
    fn default() -> Self {
        GatePhase::Idle
    }
}

impl GatePhase {
    /// Phase after one timer tick, or `None` when ticks do not apply.
    pub fn after_tick(self) -> Option<GatePhase> {
        match self {
            GatePhase::CountingDown { remaining_secs: 0 } => Some(GatePhase::Unlocked),
            GatePhase::CountingDown { remaining_secs } => Some(GatePhase::CountingDown {
                remaining_secs: remaining_secs - 1,
            }),
            GatePhase::Idle | GatePhase::Unlocked | GatePhase::Closed => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, GatePhase::CountingDown { .. } | GatePhase::Unlocked)
    }
}

/// What the user chose on the gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GateAction {
    /// Leave without opening the target. Allowed while counting down and
    /// after unlock.
    KeepFocus,
    /// Let the foreground switch through. Only after unlock.
    OpenAnyway,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GateResolution {
    Proceed,
    Denied,
    /// The hosting surface went away.
    TornDown,
    /// A gate for another target replaced this one.
    Preempted,
}

impl GateResolution {
    pub fn allows_switch(self) -> bool {
        self == GateResolution::Proceed
    }
}

/// One countdown interstitial. Settings are copied in at open time, so
/// later settings changes never alter a running session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GateSession {
    pub id: String,
    pub identifier: String,
    pub display_name: String,
    pub message: String,
    /// Mindful prompt or quote shown under the message, when one is known.
    pub prompt: Option<String>,
    pub cooldown_secs: u64,
    /// How long "open anyway" lets the target through.
    pub access_secs: u64,
    pub opened_at: DateTime<Utc>,
    pub phase: GatePhase,
    pub resolution: Option<GateResolution>,
}

impl GateSession {
    pub fn open(decision: &BlockDecision, settings: &Settings, prompt: Option<&str>) -> Self {
        let cooldown_secs = settings.cooldown_secs();
        Self {
            id: Uuid::new_v4().to_string(),
            identifier: decision.identifier.clone(),
            display_name: decision.display_name.clone(),
            message: settings.message().to_string(),
            prompt: prompt.map(str::to_string),
            cooldown_secs,
            access_secs: settings.session_duration_secs(),
            opened_at: Utc::now(),
            phase: GatePhase::CountingDown {
                remaining_secs: cooldown_secs,
            },
            resolution: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    pub fn remaining_secs(&self) -> u64 {
        match self.phase {
            GatePhase::CountingDown { remaining_secs } => remaining_secs,
            GatePhase::Idle | GatePhase::Unlocked | GatePhase::Closed => 0,
        }
    }

    /// Seconds spent counting down so far. Closed sessions report the
    /// full cooldown, so read this before closing.
    pub fn elapsed_secs(&self) -> u64 {
        match self.phase {
            GatePhase::Idle => 0,
            GatePhase::CountingDown { remaining_secs } => {
                self.cooldown_secs.saturating_sub(remaining_secs)
            }
            GatePhase::Unlocked | GatePhase::Closed => self.cooldown_secs,
        }
    }

    /// Apply one tick. Returns the new phase, or `None` if the session was
    /// not counting down.
    pub fn tick(&mut self) -> Option<GatePhase> {
        let next = self.phase.after_tick()?;
        self.phase = next;
        Some(next)
    }

    pub fn resolve(&mut self, action: GateAction) -> Result<GateResolution> {
        let resolution = match (self.phase, action) {
            (GatePhase::CountingDown { .. } | GatePhase::Unlocked, GateAction::KeepFocus) => {
                GateResolution::Denied
            }
            (GatePhase::Unlocked, GateAction::OpenAnyway) => GateResolution::Proceed,
            (GatePhase::CountingDown { remaining_secs }, GateAction::OpenAnyway) => bail!(
                "gate for {} is still counting down ({}s left)",
                self.identifier,
                remaining_secs
            ),
            (GatePhase::Idle | GatePhase::Closed, _) => {
                bail!("gate session {} is not open", self.id)
            }
        };

        self.close_with(resolution);
        Ok(resolution)
    }

    /// Close without a user decision. Returns false if already closed.
    pub fn terminate(&mut self, resolution: GateResolution) -> bool {
        if !self.is_active() {
            return false;
        }
        self.close_with(resolution);
        true
    }

    fn close_with(&mut self, resolution: GateResolution) {
        self.phase = GatePhase::Closed;
        self.resolution = Some(resolution);
    }
}
