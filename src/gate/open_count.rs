//! Attempt-limited gate: each "open" spends one of a fixed number of opens
//! and then waits out the cool-off. Cancelling during the wait gives the
//! open back.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::settings::{format_remaining, Settings};
use crate::{log_debug, log_info};

use super::state::GatePhase;

const ENABLE_LOGS: bool = true;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenCountGate {
    total_opens: u32,
    remaining_opens: u32,
    wait_secs: u64,
    phase: GatePhase,
}

impl OpenCountGate {
    pub fn new(total_opens: u32, remaining_opens: u32, wait_secs: u64) -> Self {
        Self {
            total_opens,
            remaining_opens: remaining_opens.min(total_opens),
            wait_secs,
            phase: GatePhase::Idle,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let total = settings.daily_open_limit();
        Self::new(total, total, settings.cooldown_secs())
    }

    pub fn total_opens(&self) -> u32 {
        self.total_opens
    }

    pub fn remaining_opens(&self) -> u32 {
        self.remaining_opens
    }

    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    pub fn limit_reached(&self) -> bool {
        self.remaining_opens == 0 && !matches!(self.phase, GatePhase::CountingDown { .. })
    }

    /// Take a new limit and wait. Opens already spent stay spent.
    pub fn reconfigure(&mut self, total_opens: u32, wait_secs: u64) {
        let spent = self.total_opens.saturating_sub(self.remaining_opens);
        self.total_opens = total_opens;
        self.remaining_opens = total_opens.saturating_sub(spent);
        self.wait_secs = wait_secs;
    }

    /// Spend an open and start the wait. Allowed whenever no wait is
    /// running.
    pub fn press_open(&mut self) -> Result<GatePhase> {
        if let GatePhase::CountingDown { .. } = self.phase {
            bail!("already waiting to open");
        }
        if self.remaining_opens == 0 {
            bail!("open limit reached ({} of {})", self.total_opens, self.total_opens);
        }

        self.remaining_opens -= 1;
        self.phase = GatePhase::CountingDown {
            remaining_secs: self.wait_secs,
        };
        Ok(self.phase)
    }

    pub fn tick(&mut self) -> Option<GatePhase> {
        let next = self.phase.after_tick()?;
        self.phase = next;
        Some(next)
    }

    /// Close the gate. A wait still in progress returns its open.
    pub fn cancel(&mut self) -> bool {
        let restored = matches!(self.phase, GatePhase::CountingDown { .. });
        if restored {
            self.remaining_opens = (self.remaining_opens + 1).min(self.total_opens);
        }
        self.phase = GatePhase::Closed;
        restored
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum OpenCountEvent {
    #[serde(rename_all = "camelCase")]
    WaitStarted { remaining_opens: u32, wait_secs: u64 },
    #[serde(rename_all = "camelCase")]
    WaitTick { remaining_secs: u64 },
    #[serde(rename_all = "camelCase")]
    WaitOver { remaining_opens: u32 },
    #[serde(rename_all = "camelCase")]
    WaitCancelled { remaining_opens: u32, restored: bool },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenCountSnapshot {
    pub phase: GatePhase,
    pub remaining_label: Option<String>,
    pub total_opens: u32,
    pub remaining_opens: u32,
    pub limit_reached: bool,
}

impl From<&OpenCountGate> for OpenCountSnapshot {
    fn from(gate: &OpenCountGate) -> Self {
        Self {
            phase: gate.phase,
            remaining_label: match gate.phase {
                GatePhase::CountingDown { remaining_secs } => Some(format_remaining(remaining_secs)),
                _ => None,
            },
            total_opens: gate.total_opens,
            remaining_opens: gate.remaining_opens,
            limit_reached: gate.limit_reached(),
        }
    }
}

struct OpenCountInner {
    gate: OpenCountGate,
    ticker: Option<JoinHandle<()>>,
    // Bumped on every press so a stale ticker never touches a newer wait.
    generation: u64,
}

/// Drives an [`OpenCountGate`] in real time. The limit and wait are read
/// from settings on each press.
#[derive(Clone)]
pub struct OpenCountController {
    inner: Arc<Mutex<OpenCountInner>>,
    settings: watch::Receiver<Arc<Settings>>,
    events: broadcast::Sender<OpenCountEvent>,
    tick_interval: Duration,
}

impl OpenCountController {
    pub fn new(settings: watch::Receiver<Arc<Settings>>, tick_interval: Duration) -> Self {
        let gate = OpenCountGate::from_settings(&settings.borrow());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(OpenCountInner {
                gate,
                ticker: None,
                generation: 0,
            })),
            settings,
            events,
            tick_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OpenCountEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> OpenCountSnapshot {
        OpenCountSnapshot::from(&self.inner.lock().await.gate)
    }

    pub async fn press_open(&self) -> Result<OpenCountSnapshot> {
        let settings = Arc::clone(&self.settings.borrow());
        let mut guard = self.inner.lock().await;

        if !matches!(guard.gate.phase(), GatePhase::CountingDown { .. }) {
            guard
                .gate
                .reconfigure(settings.daily_open_limit(), settings.cooldown_secs());
        }
        let phase = guard.gate.press_open()?;
        let GatePhase::CountingDown { remaining_secs } = phase else {
            bail!("open did not start a wait");
        };

        Self::stop_ticker(&mut guard);
        guard.generation += 1;
        log_info!(
            "Open pressed, {} of {} left, waiting {}s",
            guard.gate.remaining_opens(),
            guard.gate.total_opens(),
            remaining_secs
        );
        let _ = self.events.send(OpenCountEvent::WaitStarted {
            remaining_opens: guard.gate.remaining_opens(),
            wait_secs: remaining_secs,
        });
        guard.ticker = Some(self.spawn_ticker(guard.generation));
        Ok(OpenCountSnapshot::from(&guard.gate))
    }

    /// Close the gate, giving back the open if the wait was still running.
    pub async fn cancel(&self) -> Result<OpenCountSnapshot> {
        let mut guard = self.inner.lock().await;
        if !guard.gate.phase().is_active() {
            bail!("no open is pending");
        }
        Ok(self.cancel_locked(&mut guard))
    }

    /// Like `cancel`, but a no-op when nothing is pending.
    pub async fn teardown(&self) -> Option<OpenCountSnapshot> {
        let mut guard = self.inner.lock().await;
        if !guard.gate.phase().is_active() {
            return None;
        }
        Some(self.cancel_locked(&mut guard))
    }

    fn cancel_locked(&self, guard: &mut OpenCountInner) -> OpenCountSnapshot {
        Self::stop_ticker(guard);
        let restored = guard.gate.cancel();
        log_info!(
            "Open cancelled (restored={}), {} left",
            restored,
            guard.gate.remaining_opens()
        );
        let _ = self.events.send(OpenCountEvent::WaitCancelled {
            remaining_opens: guard.gate.remaining_opens(),
            restored,
        });
        OpenCountSnapshot::from(&guard.gate)
    }

    fn stop_ticker(guard: &mut OpenCountInner) {
        if let Some(handle) = guard.ticker.take() {
            handle.abort();
        }
    }

    fn spawn_ticker(&self, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let period = self.tick_interval;

        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;

                let mut guard = inner.lock().await;
                if guard.generation != generation {
                    break;
                }
                match guard.gate.tick() {
                    Some(GatePhase::CountingDown { remaining_secs }) => {
                        let _ = events.send(OpenCountEvent::WaitTick { remaining_secs });
                    }
                    Some(GatePhase::Unlocked) => {
                        log_debug!("Open wait over");
                        let _ = events.send(OpenCountEvent::WaitOver {
                            remaining_opens: guard.gate.remaining_opens(),
                        });
                        guard.ticker = None;
                        break;
                    }
                    _ => break,
                }
            }
        })
    }
}
