use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{log_debug, log_info};
use crate::monitor::BlockDecision;
use crate::settings::{format_remaining, Prompts, Settings};
use crate::usage::UsageLedger;

use super::{AccessGrants, GateAction, GatePhase, GateResolution, GateSession};

const ENABLE_LOGS: bool = true;

const EVENT_CAPACITY: usize = 64;

/// Notifications for whatever surface renders the gate.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum GateEvent {
    #[serde(rename_all = "camelCase")]
    Opened {
        session_id: String,
        identifier: String,
        display_name: String,
        cooldown_secs: u64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Tick {
        session_id: String,
        remaining_secs: u64,
    },
    #[serde(rename_all = "camelCase")]
    Unlocked { session_id: String },
    #[serde(rename_all = "camelCase")]
    Closed {
        session_id: String,
        resolution: GateResolution,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GateSnapshot {
    pub phase: GatePhase,
    /// Countdown as shown to the user, e.g. "1:05" or "42s".
    pub remaining_label: Option<String>,
    pub session: Option<GateSession>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened { session_id: String },
    /// A gate for the same target is already showing.
    AlreadyActive { session_id: String },
}

#[derive(Default)]
struct GateInner {
    session: Option<GateSession>,
    ticker: Option<JoinHandle<()>>,
}

/// Owns at most one live gate session and its countdown ticker.
///
/// Every event is sent while the inner lock is held, so subscribers never
/// see a `Tick` for a session after its `Closed`. Closed sessions are
/// counted in the usage ledger; "open anyway" also hands out an access
/// grant for the session duration.
#[derive(Clone)]
pub struct GateController {
    inner: Arc<Mutex<GateInner>>,
    settings: watch::Receiver<Arc<Settings>>,
    prompts: Option<watch::Receiver<Arc<Prompts>>>,
    events: broadcast::Sender<GateEvent>,
    grants: AccessGrants,
    usage: UsageLedger,
    tick_interval: Duration,
}

impl GateController {
    pub fn new(settings: watch::Receiver<Arc<Settings>>, tick_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(GateInner::default())),
            settings,
            prompts: None,
            events,
            grants: AccessGrants::new(),
            usage: UsageLedger::new(),
            tick_interval,
        }
    }

    /// Show the current mindful prompt or quote on every new gate.
    pub fn with_prompts(mut self, prompts: watch::Receiver<Arc<Prompts>>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn grants(&self) -> AccessGrants {
        self.grants.clone()
    }

    pub fn usage(&self) -> UsageLedger {
        self.usage.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> GateSnapshot {
        let guard = self.inner.lock().await;
        match guard.session.as_ref() {
            Some(session) => GateSnapshot {
                phase: session.phase,
                remaining_label: matches!(session.phase, GatePhase::CountingDown { .. })
                    .then(|| format_remaining(session.remaining_secs())),
                session: Some(session.clone()),
            },
            None => GateSnapshot {
                phase: GatePhase::Idle,
                remaining_label: None,
                session: None,
            },
        }
    }

    /// Show the gate for `decision`. A gate for a different target is
    /// closed as preempted first.
    pub async fn open(&self, decision: &BlockDecision) -> OpenOutcome {
        let settings = Arc::clone(&self.settings.borrow());
        let prompts = self.prompts.as_ref().map(|rx| Arc::clone(&rx.borrow()));
        let mut guard = self.inner.lock().await;

        if let Some(active) = guard.session.as_ref() {
            if active.identifier == decision.identifier {
                log_debug!("Gate for {} already showing", decision.identifier);
                return OpenOutcome::AlreadyActive {
                    session_id: active.id.clone(),
                };
            }
        }
        self.terminate_locked(&mut guard, GateResolution::Preempted);

        let prompt = prompts.as_deref().and_then(Prompts::gate_line);
        let session = GateSession::open(decision, &settings, prompt);
        let session_id = session.id.clone();
        log_info!(
            "Gate opened for {} ({}s cooldown)",
            session.identifier,
            session.cooldown_secs
        );
        self.emit(GateEvent::Opened {
            session_id: session_id.clone(),
            identifier: session.identifier.clone(),
            display_name: session.display_name.clone(),
            cooldown_secs: session.cooldown_secs,
            message: session.message.clone(),
            prompt: session.prompt.clone(),
        });

        guard.session = Some(session);
        guard.ticker = Some(self.spawn_ticker(session_id.clone()));
        OpenOutcome::Opened { session_id }
    }

    pub async fn keep_focus(&self) -> Result<GateResolution> {
        self.resolve(GateAction::KeepFocus).await
    }

    pub async fn open_anyway(&self) -> Result<GateResolution> {
        self.resolve(GateAction::OpenAnyway).await
    }

    /// Close whatever gate is showing because its surface went away.
    pub async fn teardown(&self) -> Option<GateResolution> {
        let mut guard = self.inner.lock().await;
        self.terminate_locked(&mut guard, GateResolution::TornDown)
    }

    async fn resolve(&self, action: GateAction) -> Result<GateResolution> {
        let mut guard = self.inner.lock().await;
        let session = guard
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("no gate is open"))?;

        let waited_secs = session.elapsed_secs();
        let resolution = session.resolve(action)?;
        let session_id = session.id.clone();
        log_info!("Gate for {} resolved: {:?}", session.identifier, resolution);

        let mut granted_secs = 0;
        if resolution.allows_switch() {
            let until = self
                .grants
                .grant(&session.identifier, Utc::now(), session.access_secs);
            if let Some(until) = until {
                log_info!("{} may stay open until {}", session.identifier, until);
                granted_secs = session.access_secs;
            }
        }
        self.usage.record_gate(&session.identifier, waited_secs, granted_secs);

        Self::stop_ticker(&mut guard);
        guard.session = None;
        self.emit(GateEvent::Closed {
            session_id,
            resolution,
        });
        Ok(resolution)
    }

    fn terminate_locked(
        &self,
        guard: &mut GateInner,
        resolution: GateResolution,
    ) -> Option<GateResolution> {
        Self::stop_ticker(guard);
        let mut session = guard.session.take()?;
        let waited_secs = session.elapsed_secs();
        if !session.terminate(resolution) {
            return None;
        }
        self.usage.record_gate(&session.identifier, waited_secs, 0);

        log_info!("Gate for {} closed: {:?}", session.identifier, resolution);
        self.emit(GateEvent::Closed {
            session_id: session.id,
            resolution,
        });
        Some(resolution)
    }

    fn stop_ticker(guard: &mut GateInner) {
        if let Some(handle) = guard.ticker.take() {
            handle.abort();
        }
    }

    fn spawn_ticker(&self, session_id: String) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let period = self.tick_interval;

        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;

                let mut guard = inner.lock().await;
                let Some(session) = guard.session.as_mut().filter(|s| s.id == session_id) else {
                    break;
                };
                match session.tick() {
                    Some(GatePhase::CountingDown { remaining_secs }) => {
                        let _ = events.send(GateEvent::Tick {
                            session_id: session_id.clone(),
                            remaining_secs,
                        });
                    }
                    Some(GatePhase::Unlocked) => {
                        log_debug!("Gate for {} unlocked", session.identifier);
                        let _ = events.send(GateEvent::Unlocked {
                            session_id: session_id.clone(),
                        });
                        guard.ticker = None;
                        break;
                    }
                    _ => break,
                }
            }
        })
    }

    fn emit(&self, event: GateEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::broadcast::error::TryRecvError;

    fn controller(pause_time: &str) -> (GateController, watch::Sender<Arc<Settings>>) {
        let settings = Settings {
            pause_time: pause_time.into(),
            ..Settings::default()
        };
        let (tx, rx) = watch::channel(Arc::new(settings));
        (GateController::new(rx, Duration::from_secs(1)), tx)
    }

    fn decision(identifier: &str) -> BlockDecision {
        BlockDecision {
            identifier: identifier.into(),
            display_name: identifier.into(),
            timestamp: Utc::now(),
        }
    }

    async fn next_tick(events: &mut broadcast::Receiver<GateEvent>) -> u64 {
        match events.recv().await.unwrap() {
            GateEvent::Tick { remaining_secs, .. } => remaining_secs,
            other => panic!("expected tick, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_runs_to_unlocked() {
        let (gate, _settings) = controller("3 segundos");
        let mut events = gate.subscribe();

        gate.open(&decision("com.instagram.android")).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            GateEvent::Opened { cooldown_secs: 3, .. }
        ));
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.phase, GatePhase::CountingDown { remaining_secs: 3 });
        assert_eq!(snapshot.remaining_label.as_deref(), Some("3s"));

        assert_eq!(next_tick(&mut events).await, 2);
        assert_eq!(next_tick(&mut events).await, 1);
        assert_eq!(next_tick(&mut events).await, 0);
        assert!(matches!(events.recv().await.unwrap(), GateEvent::Unlocked { .. }));
        assert_eq!(gate.snapshot().await.phase, GatePhase::Unlocked);

        assert_eq!(gate.open_anyway().await.unwrap(), GateResolution::Proceed);
        assert!(matches!(
            events.recv().await.unwrap(),
            GateEvent::Closed { resolution: GateResolution::Proceed, .. }
        ));
        assert_eq!(gate.snapshot().await.phase, GatePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_after_keep_focus() {
        let (gate, _settings) = controller("3 segundos");
        let mut events = gate.subscribe();

        gate.open(&decision("com.reddit.frontpage")).await;
        events.recv().await.unwrap();
        assert_eq!(next_tick(&mut events).await, 2);
        assert_eq!(
            gate.snapshot().await.phase,
            GatePhase::CountingDown { remaining_secs: 2 }
        );

        assert_eq!(gate.keep_focus().await.unwrap(), GateResolution::Denied);
        assert!(matches!(
            events.recv().await.unwrap(),
            GateEvent::Closed { resolution: GateResolution::Denied, .. }
        ));

        // Well past where the countdown would have unlocked.
        time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        // A closed session is dropped, so the controller reads as idle.
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.phase, GatePhase::Idle);
        assert!(snapshot.session.is_none());
        assert!(gate.keep_focus().await.is_err());

        let usage = gate.usage().snapshot();
        assert_eq!(usage.blocks_triggered, 1);
        assert_eq!(usage.seconds_waited, 1);
        assert!(usage.apps_used.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_anyway_grants_access() {
        let settings = Settings {
            pause_time: "1 segundo".into(),
            session_duration: "2 minutos".into(),
            ..Settings::default()
        };
        let (_tx, rx) = watch::channel(Arc::new(settings));
        let gate = GateController::new(rx, Duration::from_secs(1));
        let grants = gate.grants();
        let mut events = gate.subscribe();

        gate.open(&decision("com.instagram.android")).await;
        assert!(!grants.is_granted("com.instagram.android", Utc::now()));
        events.recv().await.unwrap();
        assert_eq!(next_tick(&mut events).await, 0);
        assert!(matches!(events.recv().await.unwrap(), GateEvent::Unlocked { .. }));

        assert_eq!(gate.open_anyway().await.unwrap(), GateResolution::Proceed);
        assert!(grants.is_granted("com.instagram.android", Utc::now()));
        assert!(!grants.is_granted(
            "com.instagram.android",
            Utc::now() + chrono::Duration::seconds(121)
        ));

        let usage = gate.usage().snapshot();
        assert_eq!(usage.apps_used.get("com.instagram.android"), Some(&120));
        assert_eq!(usage.total_screen_time, 120);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opened_event_carries_prompt() {
        let (gate, _settings) = controller("3 segundos");
        let (_prompts_tx, prompts_rx) = watch::channel(Arc::new(Prompts {
            focus_quote: Some("Un paso a la vez.".into()),
            ..Prompts::default()
        }));
        let gate = gate.with_prompts(prompts_rx);
        let mut events = gate.subscribe();

        gate.open(&decision("com.instagram.android")).await;
        match events.recv().await.unwrap() {
            GateEvent::Opened { prompt, message, .. } => {
                assert_eq!(prompt.as_deref(), Some("Un paso a la vez."));
                assert_eq!(message, Settings::default().custom_message);
            }
            other => panic!("expected opened, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_anyway_rejected_while_counting() {
        let (gate, _settings) = controller("5 segundos");
        gate.open(&decision("com.reddit.frontpage")).await;

        assert!(gate.open_anyway().await.is_err());
        assert!(gate.snapshot().await.phase.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_target_preempts_active_gate() {
        let (gate, _settings) = controller("30 segundos");
        let mut events = gate.subscribe();

        let first = match gate.open(&decision("com.instagram.android")).await {
            OpenOutcome::Opened { session_id } => session_id,
            other => panic!("unexpected {:?}", other),
        };
        gate.open(&decision("com.reddit.frontpage")).await;

        events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            GateEvent::Closed {
                session_id,
                resolution,
            } => {
                assert_eq!(session_id, first);
                assert_eq!(resolution, GateResolution::Preempted);
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            GateEvent::Opened { ref identifier, .. } if identifier == "com.reddit.frontpage"
        ));

        // Only the second session keeps ticking.
        match events.recv().await.unwrap() {
            GateEvent::Tick { session_id, .. } => assert_ne!(session_id, first),
            other => panic!("expected tick, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_target_does_not_open_twice() {
        let (gate, _settings) = controller("3 segundos");
        let mut events = gate.subscribe();

        let first = gate.open(&decision("com.instagram.android")).await;
        let second = gate.open(&decision("com.instagram.android")).await;
        match (first, second) {
            (OpenOutcome::Opened { session_id: a }, OpenOutcome::AlreadyActive { session_id: b }) => {
                assert_eq!(a, b)
            }
            other => panic!("unexpected {:?}", other),
        }

        events.recv().await.unwrap();
        assert_eq!(next_tick(&mut events).await, 2);
        assert_eq!(next_tick(&mut events).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_ticker() {
        let (gate, _settings) = controller("30 segundos");
        let mut events = gate.subscribe();

        gate.open(&decision("com.instagram.android")).await;
        events.recv().await.unwrap();

        assert_eq!(gate.teardown().await, Some(GateResolution::TornDown));
        assert_eq!(gate.usage().snapshot().blocks_triggered, 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            GateEvent::Closed { resolution: GateResolution::TornDown, .. }
        ));
        time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(gate.teardown().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_change_does_not_affect_running_gate() {
        let (gate, settings) = controller("2 segundos");
        let mut events = gate.subscribe();

        gate.open(&decision("com.instagram.android")).await;
        settings.send_replace(Arc::new(Settings {
            pause_time: "1 hora".into(),
            ..Settings::default()
        }));

        events.recv().await.unwrap();
        assert_eq!(next_tick(&mut events).await, 1);
        assert_eq!(next_tick(&mut events).await, 0);
        assert!(matches!(events.recv().await.unwrap(), GateEvent::Unlocked { .. }));
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot.session.map(|s| s.cooldown_secs), Some(2));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(GateEvent::Tick {
            session_id: "s1".into(),
            remaining_secs: 4,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "tick", "sessionId": "s1", "remainingSecs": 4})
        );
    }
}
