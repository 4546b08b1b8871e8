#![forbid(unsafe_code)]

// Iteration bodies for the two load scenarios. Each exposes an async
// `iteration` the scheduler drives through a closure; both no-op on an
// unusable fixture set instead of failing the run.

pub mod rest;
pub mod ws;

pub use rest::RestScenario;
pub use ws::{WsOptions, WsScenario};
