#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

//! edgeterm library — remote terminal tunnel agent for Linux edge devices.
//!
//! The agent dials a single outbound WebSocket to a cloud controller and
//! multiplexes interactive shell sessions over it. The building blocks:
//!
//! - `config` — JSON config file loading and validation
//! - `terminal` — PTY-backed shell sessions (spawn, pump, resize, teardown)
//! - `tunnel` — envelope codec, session registry, WebSocket transport, and
//!   the reconnecting tunnel controller

pub mod config;
pub mod terminal;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use terminal::{Terminal, TerminalEvent};
pub use tunnel::client::Tunnel;
