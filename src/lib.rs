//! claude-batch - multi-user batch execution around the Claude CLI
//!
//! Accepts natural-language prompts, provisions an isolated copy-on-write
//! workspace from a registered repository, runs the assistant inside it
//! under the submitting user's OS identity, and persists every state
//! change before it becomes observable.

pub mod agent;
pub mod cidx;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod git;
pub mod job;
pub mod process;
pub mod repo;
pub mod workspace;

pub use domain::*;
pub use engine::{CreateOptions, CreateRequest, DeleteOutcome, Engine};
pub use error::{EngineError, EngineResult};
