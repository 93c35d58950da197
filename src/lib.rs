//! Area input core
//!
//! Device-input core of a display server: the resource and client directory,
//! the client scheduler, the grab arbiter and the event delivery engine, plus
//! the dispatch loop that serializes access to them.

pub mod config;
pub mod dispatch;
pub mod dix;
