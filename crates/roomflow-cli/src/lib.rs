//! Command implementations behind the `roomflow` binary, exposed as a
//! library so integration tests can drive them against an in-memory state.

pub mod commands;
