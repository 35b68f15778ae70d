pub mod bridge;
pub mod duration;
pub mod model;
pub mod prompts;
pub mod remote;

pub use bridge::{RefreshOutcome, SaveOutcome, SettingsBridge};
pub use duration::format_remaining;
pub use model::Settings;
pub use prompts::{PromptBoard, PromptKind, Prompts};
pub use remote::{OfflineRemote, SettingsRemote};
