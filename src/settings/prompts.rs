use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::remote::SettingsRemote;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PromptKind {
    MindfulPrompt,
    DailyTask,
    FocusQuote,
}

/// Short texts from the settings service. Each one is optional; a failed
/// fetch leaves the previous text in place.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Prompts {
    pub mindful_prompt: Option<String>,
    pub daily_task: Option<String>,
    pub focus_quote: Option<String>,
}

impl Prompts {
    /// The line shown on a gate: the mindful prompt, else the focus quote.
    pub fn gate_line(&self) -> Option<&str> {
        self.mindful_prompt
            .as_deref()
            .or(self.focus_quote.as_deref())
    }

    fn slot(&mut self, kind: PromptKind) -> &mut Option<String> {
        match kind {
            PromptKind::MindfulPrompt => &mut self.mindful_prompt,
            PromptKind::DailyTask => &mut self.daily_task,
            PromptKind::FocusQuote => &mut self.focus_quote,
        }
    }
}

pub struct PromptBoard {
    remote: Arc<dyn SettingsRemote>,
    current: watch::Sender<Arc<Prompts>>,
}

impl PromptBoard {
    pub fn new(remote: Arc<dyn SettingsRemote>) -> Self {
        let (current, _) = watch::channel(Arc::new(Prompts::default()));
        Self { remote, current }
    }

    pub fn current(&self) -> Arc<Prompts> {
        Arc::clone(&self.current.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Prompts>> {
        self.current.subscribe()
    }

    /// Fetch all three texts at once. Returns how many arrived.
    pub async fn refresh(&self) -> usize {
        let remote = &self.remote;
        let (mindful, task, quote) = tokio::join!(
            remote.fetch_prompt(PromptKind::MindfulPrompt),
            remote.fetch_prompt(PromptKind::DailyTask),
            remote.fetch_prompt(PromptKind::FocusQuote),
        );

        let mut next = (*self.current()).clone();
        let mut fetched = 0;
        for (kind, result) in [
            (PromptKind::MindfulPrompt, mindful),
            (PromptKind::DailyTask, task),
            (PromptKind::FocusQuote, quote),
        ] {
            match result {
                Ok(text) if !text.trim().is_empty() => {
                    *next.slot(kind) = Some(text.trim().to_string());
                    fetched += 1;
                }
                Ok(_) => debug!("Empty {:?} from settings service", kind),
                Err(err) => debug!("Could not fetch {:?}: {err:#}", kind),
            }
        }

        if fetched > 0 {
            info!("Fetched {fetched} prompts");
            self.current.send_replace(Arc::new(next));
        }
        fetched
    }
}
