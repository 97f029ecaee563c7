//! switchboard server library.
//!
//! Re-exports the API router and shared state so integration tests can
//! drive the HTTP surface without spawning the binary.

pub mod api;
pub mod state;
