use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::gate::{GateController, OpenOutcome};

use super::filter::{FilterVerdict, FocusEvent, ForegroundMonitor};

/// Background consumer of foreground changes. Blocked apps open a gate.
pub struct MonitorService {
    monitor: Arc<ForegroundMonitor>,
    gate: GateController,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl MonitorService {
    pub fn new(monitor: Arc<ForegroundMonitor>, gate: GateController) -> Self {
        Self {
            monitor,
            gate,
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Start consuming `events`. A loop that already ended because its
    /// source closed does not count as running.
    pub fn start(&mut self, events: mpsc::Receiver<FocusEvent>) -> Result<()> {
        if self.is_running() {
            bail!("monitor already running");
        }
        self.handle = None;
        self.cancel_token = None;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            Arc::clone(&self.monitor),
            self.gate.clone(),
            events,
            cancel_token.clone(),
        ));

        info!("Foreground monitor started");
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Stop consuming events and tear down any gate still showing.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let joined = match self.handle.take() {
            Some(handle) => handle
                .await
                .context("monitor loop task failed to join"),
            None => Ok(()),
        };

        self.gate.teardown().await;
        info!("Foreground monitor stopped");
        joined
    }
}

async fn monitor_loop(
    monitor: Arc<ForegroundMonitor>,
    gate: GateController,
    mut events: mpsc::Receiver<FocusEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    warn!("Focus event source closed");
                    break;
                };
                handle_event(&monitor, &gate, event).await;
            }
        }
    }
}

async fn handle_event(monitor: &ForegroundMonitor, gate: &GateController, event: FocusEvent) {
    let FilterVerdict::Blocked(decision) = monitor.evaluate(&event) else {
        return;
    };

    match gate.open(&decision).await {
        OpenOutcome::Opened { session_id } => {
            info!(
                "Gating {} ({}) in session {}",
                decision.display_name, decision.identifier, session_id
            );
        }
        OpenOutcome::AlreadyActive { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_set::{BlockSet, BlockedTarget};
    use crate::gate::{GateEvent, GatePhase, GateResolution};
    use crate::monitor::MonitorRules;
    use crate::settings::Settings;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::{broadcast, watch};

    fn service() -> (MonitorService, GateController, BlockSet) {
        service_with(Settings::default())
    }

    fn service_with(settings: Settings) -> (MonitorService, GateController, BlockSet) {
        let block_set = BlockSet::new();
        block_set.replace(vec![BlockedTarget::new("com.instagram.android", "Instagram")]);
        let rules = MonitorRules {
            own_identifier: "com.zengate.app".into(),
            system_identifiers: vec!["android".into()],
            system_prefixes: Vec::new(),
            debounce_window: chrono::Duration::seconds(2),
        };
        let (_tx, rx) = watch::channel(Arc::new(settings));
        let gate = GateController::new(rx, Duration::from_secs(1));
        let monitor = Arc::new(ForegroundMonitor::new(rules, block_set.clone(), gate.grants()));
        (MonitorService::new(monitor, gate.clone()), gate, block_set)
    }

    fn focus_at(identifier: &str, offset_secs: i64) -> FocusEvent {
        FocusEvent {
            identifier: identifier.into(),
            timestamp: Utc::now() + chrono::Duration::seconds(offset_secs),
        }
    }

    fn drain_opened(events: &mut broadcast::Receiver<GateEvent>) -> usize {
        let mut opened = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, GateEvent::Opened { .. }) {
                opened += 1;
            }
        }
        opened
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_focus_opens_gate() {
        let (mut service, gate, _block_set) = service();
        let mut gate_events = gate.subscribe();
        let (tx, rx) = mpsc::channel(16);
        service.start(rx).unwrap();
        assert!(service.start(mpsc::channel(1).1).is_err());

        tx.send(FocusEvent::now("com.zengate.app")).await.unwrap();
        tx.send(FocusEvent::now("org.mozilla.firefox")).await.unwrap();
        tx.send(FocusEvent::now("com.instagram.android")).await.unwrap();

        match gate_events.recv().await.unwrap() {
            GateEvent::Opened {
                identifier,
                display_name,
                cooldown_secs,
                ..
            } => {
                assert_eq!(identifier, "com.instagram.android");
                assert_eq!(display_name, "Instagram");
                assert_eq!(cooldown_secs, 30);
            }
            other => panic!("unexpected event {:?}", other),
        }

        service.stop().await.unwrap();
        assert!(matches!(
            gate_events.recv().await.unwrap(),
            GateEvent::Closed { resolution: GateResolution::TornDown, .. }
        ));
        assert!(!service.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_when_source_closes() {
        let (mut service, _gate, _block_set) = service();
        let (tx, rx) = mpsc::channel(4);
        service.start(rx).unwrap();
        drop(tx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!service.is_running());
        service.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_source_closed() {
        let (mut service, gate, _block_set) = service();
        let mut gate_events = gate.subscribe();
        let (tx, rx) = mpsc::channel(4);
        service.start(rx).unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (tx, rx) = mpsc::channel(4);
        service.start(rx).unwrap();
        assert!(service.is_running());
        tx.send(FocusEvent::now("com.instagram.android")).await.unwrap();
        assert!(matches!(
            gate_events.recv().await.unwrap(),
            GateEvent::Opened { .. }
        ));
        service.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_anyway_lets_target_through() {
        let (mut service, gate, _block_set) = service_with(Settings {
            pause_time: "1 segundo".into(),
            ..Settings::default()
        });
        let mut gate_events = gate.subscribe();
        let (tx, rx) = mpsc::channel(16);
        service.start(rx).unwrap();

        tx.send(focus_at("com.instagram.android", 0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(gate.open_anyway().await.unwrap(), GateResolution::Proceed);

        // Past the debounce window, inside the ten minute session.
        tx.send(focus_at("com.instagram.android", 3)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(drain_opened(&mut gate_events), 1);
        assert_eq!(gate.snapshot().await.phase, GatePhase::Idle);

        // Once the session runs out the gate is back.
        tx.send(focus_at("com.instagram.android", 11 * 60)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(drain_opened(&mut gate_events), 1);

        service.stop().await.unwrap();
    }
}
