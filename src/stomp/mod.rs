#![forbid(unsafe_code)]

// Minimal STOMP support: the text-frame codec and the per-connection
// session state machine driven by the websocket scenario.

pub mod frame;
pub mod session;

pub use frame::{Command, Frame, FrameError};
pub use session::{SessionState, SessionStep, StompSession};
