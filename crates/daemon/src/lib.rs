//! `folderd` daemon library — everything the `folderd` binary links
//! against. Split out from the binary crate the way `codescope_server`
//! backs `codescope`'s `main.rs`, so integration tests can exercise the
//! daemon without spawning the process.

pub mod control_plane;
pub mod embedder;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod model_registry;
pub mod orchestrator;
pub mod pipeline;
pub mod shutdown;
pub mod singleton;
pub mod supervisor;
pub mod task_queue;
pub mod watcher;
