use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite},
    sync::{
        broadcast::{
            self,
            error::{RecvError, TryRecvError},
        },
        mpsc, Mutex,
    },
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    block_set::{BlockSet, BlockedTarget},
    catalog::{self, AppCatalog, CategoryGroup},
    config::AppConfig,
    db::Database,
    feed::{self, FeedCommand},
    gate::{GateController, GateResolution, GateSnapshot, OpenCountController, OpenCountSnapshot},
    log_warn,
    monitor::{FocusEvent, ForegroundMonitor, MonitorService},
    settings::{PromptBoard, Prompts, RefreshOutcome, SaveOutcome, SettingsBridge, SettingsRemote},
    usage::{self, BackupOutcome, UsageLedger, UsageReport},
};

const ENABLE_LOGS: bool = true;

const FOCUS_QUEUE: usize = 256;

pub type SharedOutput = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

#[derive(Serialize)]
#[serde(tag = "response", rename_all = "camelCase")]
enum Response {
    Status { snapshot: GateSnapshot },
    Apps { groups: Vec<CategoryGroup> },
    Blocked { targets: Vec<BlockedTarget> },
    Resolved { resolution: GateResolution },
    Opens { snapshot: OpenCountSnapshot },
    Prompts { prompts: Prompts },
    Usage { report: UsageReport },
    BackedUp { outcome: BackupOutcome },
    Saved { outcome: SaveOutcome },
    #[serde(rename_all = "camelCase")]
    Refreshed {
        outcome: RefreshOutcome,
        pending_sync: bool,
    },
}

/// Everything wired together: settings, monitor, gates, and the background
/// tasks that forward gate events and keep in sync with the settings
/// service.
pub struct Runtime {
    config: AppConfig,
    bridge: Arc<SettingsBridge>,
    remote: Arc<dyn SettingsRemote>,
    catalog: Arc<dyn AppCatalog>,
    prompts: Arc<PromptBoard>,
    gate: GateController,
    open_count: OpenCountController,
    usage: UsageLedger,
    monitor: MonitorService,
    focus_tx: mpsc::Sender<FocusEvent>,
    output: SharedOutput,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub async fn start(
        config: AppConfig,
        remote: Arc<dyn SettingsRemote>,
        catalog: Arc<dyn AppCatalog>,
        output: SharedOutput,
    ) -> Result<Self> {
        let db = Database::new(config.database_path())?;
        info!("Database ready at {}", db.path().display());

        let block_set = BlockSet::new();
        let bridge = Arc::new(
            SettingsBridge::load(
                db,
                Arc::clone(&remote),
                Arc::clone(&catalog),
                block_set.clone(),
            )
            .await?,
        );
        match bridge.refresh(&config.user_id).await {
            RefreshOutcome::Fresh => {}
            RefreshOutcome::Stale { reason } => {
                log_warn!("Starting with cached settings: {}", reason);
            }
        }
        info!("Watching {} blocked apps", block_set.len());
        let prompts = Arc::new(PromptBoard::new(Arc::clone(&remote)));
        prompts.refresh().await;

        let gate = GateController::new(bridge.subscribe(), config.tick_interval())
            .with_prompts(prompts.subscribe());
        let open_count = OpenCountController::new(bridge.subscribe(), config.tick_interval());
        let usage = gate.usage();

        let monitor = Arc::new(ForegroundMonitor::new(
            config.monitor_rules(),
            block_set,
            gate.grants(),
        ));
        let mut monitor = MonitorService::new(monitor, gate.clone());
        let (focus_tx, focus_rx) = mpsc::channel(FOCUS_QUEUE);
        monitor.start(focus_rx)?;

        let cancel_token = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(forward_events(
                gate.subscribe(),
                Arc::clone(&output),
                cancel_token.clone(),
            )),
            tokio::spawn(forward_events(
                open_count.subscribe(),
                Arc::clone(&output),
                cancel_token.clone(),
            )),
            tokio::spawn(sync_periodically(
                SyncJob {
                    bridge: Arc::clone(&bridge),
                    prompts: Arc::clone(&prompts),
                    usage: usage.clone(),
                    remote: Arc::clone(&remote),
                    user_id: config.user_id.clone(),
                },
                config.refresh_interval(),
                cancel_token.clone(),
            )),
        ];

        Ok(Self {
            config,
            bridge,
            remote,
            catalog,
            prompts,
            gate,
            open_count,
            usage,
            monitor,
            focus_tx,
            output,
            cancel_token,
            tasks,
        })
    }

    /// Read commands until `quit` or end of input.
    pub async fn serve<R>(&self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context("failed to read input")? {
            let command = match feed::parse_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(message) => {
                    self.write_error(&message).await?;
                    continue;
                }
            };
            if command == FeedCommand::Quit {
                break;
            }
            if let Err(err) = self.handle(command).await {
                self.write_error(&format!("{err:#}")).await?;
            }
        }
        Ok(())
    }

    async fn handle(&self, command: FeedCommand) -> Result<()> {
        let response = match command {
            FeedCommand::Focus(identifier) => {
                self.focus_tx
                    .send(FocusEvent::now(identifier))
                    .await
                    .context("monitor is not running")?;
                return Ok(());
            }
            FeedCommand::OpenAnyway => Response::Resolved {
                resolution: self.gate.open_anyway().await?,
            },
            FeedCommand::KeepFocus => Response::Resolved {
                resolution: self.gate.keep_focus().await?,
            },
            FeedCommand::Status => Response::Status {
                snapshot: self.gate.snapshot().await,
            },
            FeedCommand::Apps(query) => {
                let source = Arc::clone(&self.catalog);
                let apps = tokio::task::spawn_blocking(move || source.list_installed_applications())
                    .await
                    .context("app catalog worker failed")??;
                let entries = catalog::search(&apps, &query, self.bridge.block_set());
                Response::Apps {
                    groups: catalog::group_by_category(entries),
                }
            }
            FeedCommand::Blocked => Response::Blocked {
                targets: self.bridge.block_set().targets(),
            },
            FeedCommand::Block(identifier) => {
                let mut settings = (*self.bridge.current()).clone();
                if !settings.selected_apps.contains(&identifier) {
                    settings.selected_apps.push(identifier);
                }
                Response::Saved {
                    outcome: self.bridge.save(&self.config.user_id, settings).await?,
                }
            }
            FeedCommand::Unblock(identifier) => {
                let mut settings = (*self.bridge.current()).clone();
                settings.selected_apps.retain(|app| *app != identifier);
                Response::Saved {
                    outcome: self.bridge.save(&self.config.user_id, settings).await?,
                }
            }
            FeedCommand::PressOpen => Response::Opens {
                snapshot: self.open_count.press_open().await?,
            },
            FeedCommand::CancelOpen => Response::Opens {
                snapshot: self.open_count.cancel().await?,
            },
            FeedCommand::Opens => Response::Opens {
                snapshot: self.open_count.snapshot().await,
            },
            FeedCommand::Prompts => Response::Prompts {
                prompts: (*self.prompts.current()).clone(),
            },
            FeedCommand::Usage => Response::Usage {
                report: self.usage.snapshot(),
            },
            FeedCommand::Backup => Response::BackedUp {
                outcome: usage::backup(&self.usage, self.remote.as_ref(), &self.config.user_id)
                    .await,
            },
            FeedCommand::Refresh => {
                let outcome = self.bridge.refresh(&self.config.user_id).await;
                self.prompts.refresh().await;
                Response::Refreshed {
                    outcome,
                    pending_sync: self.bridge.has_pending_sync(),
                }
            }
            FeedCommand::Quit => return Ok(()),
        };

        let mut out = self.output.lock().await;
        feed::write_json(&mut *out, &response).await
    }

    async fn write_error(&self, message: &str) -> Result<()> {
        let mut out = self.output.lock().await;
        feed::write_error(&mut *out, message).await
    }

    /// Close whatever is showing, back up usage one last time, then stop
    /// the background tasks once their last events are written.
    pub async fn shutdown(mut self) -> Result<()> {
        let stopped = self.monitor.stop().await;
        self.open_count.teardown().await;
        usage::backup(&self.usage, self.remote.as_ref(), &self.config.user_id).await;

        self.cancel_token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                log_warn!("Background task ended abnormally: {}", err);
            }
        }
        info!("ZenGate shut down");
        stopped
    }
}

async fn forward_events<E>(
    mut events: broadcast::Receiver<E>,
    output: SharedOutput,
    cancel_token: CancellationToken,
) where
    E: Serialize + Clone + Send + 'static,
{
    loop {
        // Pending events win over cancellation.
        let event = tokio::select! {
            biased;
            received = events.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log_warn!("Event output lagged, skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
            _ = cancel_token.cancelled() => break,
        };
        write_event(&output, &event).await;
    }

    // Whatever was sent before cancellation still goes out.
    loop {
        match events.try_recv() {
            Ok(event) => write_event(&output, &event).await,
            Err(TryRecvError::Lagged(skipped)) => {
                log_warn!("Event output lagged, skipped {} events", skipped);
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

async fn write_event<E: Serialize>(output: &SharedOutput, event: &E) {
    let mut out = output.lock().await;
    if let Err(err) = feed::write_json(&mut *out, event).await {
        log_warn!("Failed to write event: {:#}", err);
    }
}

struct SyncJob {
    bridge: Arc<SettingsBridge>,
    prompts: Arc<PromptBoard>,
    usage: UsageLedger,
    remote: Arc<dyn SettingsRemote>,
    user_id: String,
}

async fn sync_periodically(
    job: SyncJob,
    period: std::time::Duration,
    cancel_token: CancellationToken,
) {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = interval.tick() => {
                if let RefreshOutcome::Stale { reason } = job.bridge.refresh(&job.user_id).await {
                    log_warn!("Periodic settings refresh failed: {}", reason);
                }
                job.prompts.refresh().await;
                usage::backup(&job.usage, job.remote.as_ref(), &job.user_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InstalledApp;
    use crate::settings::OfflineRemote;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncReadExt, BufReader, DuplexStream};

    struct FakeCatalog;

    impl AppCatalog for FakeCatalog {
        fn list_installed_applications(&self) -> Result<Vec<InstalledApp>> {
            Ok(vec![InstalledApp {
                identifier: "com.instagram.android".into(),
                display_name: "Instagram".into(),
                icon: None,
            }])
        }
    }

    async fn start() -> (Runtime, DuplexStream, TempDir) {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().to_path_buf()).unwrap();
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let output: SharedOutput = Arc::new(Mutex::new(Box::new(writer)));

        let runtime = Runtime::start(
            config,
            Arc::new(OfflineRemote),
            Arc::new(FakeCatalog),
            output,
        )
        .await
        .unwrap();
        (runtime, reader, dir)
    }

    async fn read_lines(mut reader: DuplexStream) -> Vec<serde_json::Value> {
        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        text.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_scripted_session() {
        let (runtime, reader, _dir) = start().await;

        let script = "block com.instagram.android\napps insta\nrefresh\nfocus com.instagram.android\nbogus\n";
        runtime.serve(BufReader::new(script.as_bytes())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime
            .serve(BufReader::new(
                "open\nkeep\nstatus\nblocked\nusage\nquit\nstatus\n".as_bytes(),
            ))
            .await
            .unwrap();
        runtime.shutdown().await.unwrap();

        let lines = read_lines(reader).await;
        assert_eq!(lines[0]["response"], "saved");
        assert_eq!(lines[0]["outcome"]["kind"], "pendingSync");
        assert_eq!(lines[1]["groups"][0]["label"], "Redes Sociales");
        assert_eq!(lines[1]["groups"][0]["apps"][0]["blocked"], true);
        assert_eq!(lines[2]["response"], "refreshed");
        assert_eq!(lines[2]["outcome"]["kind"], "stale");
        assert_eq!(lines[2]["pendingSync"], true);
        assert!(lines
            .iter()
            .any(|l| l["event"] == "opened" && l["displayName"] == "Instagram"));
        assert!(lines.iter().any(|l| l["error"] == "unknown command `bogus`"));
        // "open" is rejected mid-countdown, "keep" closes the gate.
        assert!(lines
            .iter()
            .any(|l| l["response"] == "resolved" && l["resolution"] == "denied"));
        let statuses: Vec<&serde_json::Value> =
            lines.iter().filter(|l| l["response"] == "status").collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["snapshot"]["phase"]["status"], "idle");

        let blocked = lines.iter().find(|l| l["response"] == "blocked").unwrap();
        assert_eq!(blocked["targets"][0]["identifier"], "com.instagram.android");
        let usage = lines.iter().find(|l| l["response"] == "usage").unwrap();
        assert_eq!(usage["report"]["blocksTriggered"], 1);
    }

    #[tokio::test]
    async fn test_shutdown_reports_torn_down_gate() {
        for _ in 0..5 {
            let (runtime, reader, _dir) = start().await;
            runtime
                .serve(BufReader::new(
                    "block com.instagram.android\nfocus com.instagram.android\n".as_bytes(),
                ))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            runtime.shutdown().await.unwrap();

            let lines = read_lines(reader).await;
            assert!(lines.iter().any(|l| l["event"] == "opened"));
            assert!(lines
                .iter()
                .any(|l| l["event"] == "closed" && l["resolution"] == "tornDown"));
        }
    }

    #[tokio::test]
    async fn test_daily_opens_commands() {
        let (runtime, reader, _dir) = start().await;
        runtime
            .serve(BufReader::new("press\ncancel\ncancel\nopens\n".as_bytes()))
            .await
            .unwrap();
        runtime.shutdown().await.unwrap();

        let lines = read_lines(reader).await;
        let opens: Vec<&serde_json::Value> =
            lines.iter().filter(|l| l["response"] == "opens").collect();
        assert_eq!(opens[0]["snapshot"]["remainingOpens"], 2);
        assert_eq!(opens[1]["snapshot"]["remainingOpens"], 3);
        assert_eq!(opens[2]["snapshot"]["phase"]["status"], "closed");
        assert!(lines.iter().any(|l| l["error"] == "no open is pending"));
        assert!(lines.iter().any(|l| l["event"] == "waitStarted"));
        assert!(lines
            .iter()
            .any(|l| l["event"] == "waitCancelled" && l["restored"] == true));
    }
}
