//! Keypad input collection: scenarios, stages, validation

pub mod digits;
pub mod outcome;
pub mod scenario;
pub mod stage;

pub use digits::DtmfKey;
pub use outcome::{CallAction, InputOutcome, InputStatus};
pub use scenario::{ScenarioCatalog, ScenarioDefinition, ScenarioPrompts};
pub use stage::{AppendResult, StageCollector, StageStatus, StageVerdict};
