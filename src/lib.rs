//! Runs chains of saved HTTP requests as workflows: each step's response can
//! feed variables into the steps after it.

pub mod engine;
pub mod extractor;
pub mod schema;
pub mod server;
pub mod store;
pub mod template;
pub mod transport;
pub mod variables;

pub use engine::{Engine, ExecutionObserver, ExecutionResult, ExecutionStatus, RequestLookup, RunInput, StepResult, StepStatus};
pub use schema::{CollectionFile, GlobalSettings, HttpRequest, HttpResponse, Workflow, WorkflowStep};
pub use store::WorkflowStore;
pub use template::{TemplateEngine, VariableResolver};
pub use transport::{HttpExecutor, RequestExecutor};
