pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;

pub use config::EngineConfig;
pub use context::StateContext;
pub use error::{NodeError, Result, WeftError};
pub use event::{EventBus, WorkflowEvent};
pub use state::*;
pub use traits::{handler_fn, task_fn, CheckpointStore, NodeHandler, ParallelTask, RoutePredicate};
