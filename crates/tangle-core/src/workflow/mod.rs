//! Workflow engine - declarative multi-step agent orchestration.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► Workflow ──► validate ──► WorkflowEngine
//!                                                  │  one task per execution
//!                                             graph driver (ready set)
//!                                                  │
//!                                             StepExecutor ──► AgentManager
//!                                                  │        ──► EntanglementCoordinator
//!                                                  │        ──► HttpClient
//!                                          loop / parallel re-enter the driver
//! ```

pub mod cancel;
pub mod engine;
pub mod executor;
pub mod expression;
pub mod http;
pub mod schema;
pub mod signals;
pub mod template;
pub mod transform;
pub mod validate;

pub use cancel::CancelSignal;
pub use engine::{EngineStats, StartOptions, WorkflowEngine};
pub use executor::{NoopObserver, StepContext, StepExecutor, StepObserver};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use schema::{
    FailurePolicy, OnFailure, RetryPolicy, StepDef, StepKind, StepType, Workflow,
};
pub use signals::SignalHub;
pub use transform::TransformFn;
pub use validate::validate_workflow;
