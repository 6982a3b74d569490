//! Graph workflow executor.
//!
//! A flow is a directed graph of nodes bound to components. Acyclic graphs run in
//! topological order with port-based activation; graphs with cycles run from a ready queue
//! bounded by visit and iteration caps. Runs can be time-limited, suspended to a checkpoint
//! and resumed later.

pub mod builtin;
pub mod checkpoint;
pub mod component;
pub mod config;
pub mod context;
pub mod cycles;
pub mod engine;
pub mod errors;
pub mod events;
pub mod graph;
pub mod hooks;
pub mod metadata;
pub mod registry;
pub mod routing;
pub mod scheduler;
mod step;
mod timeout;
pub mod worker;

pub use checkpoint::*;
pub use component::*;
pub use config::*;
pub use context::*;
pub use cycles::*;
pub use engine::*;
pub use errors::*;
pub use events::*;
pub use graph::*;
pub use hooks::*;
pub use metadata::*;
pub use registry::*;
pub use routing::*;
pub use scheduler::*;
pub use step::StepOutcome;
pub use timeout::DEADLINE_CHECK_WARNING_THRESHOLD;
pub use worker::*;
