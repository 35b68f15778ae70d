pub mod debounce;
pub mod filter;
pub mod service;

pub use debounce::{EventDebouncer, DEFAULT_DEBOUNCE_MS};
pub use filter::{BlockDecision, FilterVerdict, FocusEvent, ForegroundMonitor, MonitorRules};
pub use service::MonitorService;
