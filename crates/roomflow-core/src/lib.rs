//! Roomflow Core — flowchart automation and the per-room task queue.
//!
//! This crate contains the data models, SQLite stores, the flowchart
//! engine with its node handlers, the durable task queue and the bridge
//! that runs flowcharts through that queue. It has **no HTTP framework
//! dependency**; a CLI or server wraps it.

pub mod bridge;
pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod flowchart;
pub mod models;
pub mod queue;
pub mod state;
pub mod store;

// Convenience re-exports
pub use db::Database;
pub use error::EngineError;
pub use state::{AppState, AppStateInner};
