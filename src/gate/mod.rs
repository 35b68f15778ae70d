pub mod controller;
pub mod grants;
pub mod open_count;
pub mod state;

pub use controller::{GateController, GateEvent, GateSnapshot, OpenOutcome};
pub use grants::AccessGrants;
pub use open_count::{OpenCountController, OpenCountEvent, OpenCountGate, OpenCountSnapshot};
pub use state::{GateAction, GatePhase, GateResolution, GateSession};
