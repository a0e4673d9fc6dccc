pub mod agent;
pub mod audit;
pub mod entanglement;
pub mod execution;

pub use agent::*;
pub use audit::*;
pub use entanglement::*;
pub use execution::*;
pub use crate::workflow::schema::{StepDef, StepKind, StepType, Workflow};
