//! autoclaude-daemon - the orchestration engine.
//!
//! The [`daemon`] module owns the poll loop and all worker bookkeeping;
//! the [`worker`] module advances a single pull request by at most one
//! action per poll. Both are exposed as a library so integration tests can
//! drive them with mock collaborators; the `auto-claude` binary wires in
//! the real ones.

pub mod daemon;
pub mod logging;
pub mod tui;
pub mod worker;

pub use daemon::{Daemon, worker_key};
pub use worker::{Worker, WorkerContext, WorkerError};
