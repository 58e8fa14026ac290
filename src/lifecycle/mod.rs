//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Init logging/metrics/tracing → Spawn span processor → Bind listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Server stops accepting and drains → Span processor drains and flushes → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: HTTP first so its last spans reach the export queue
//! - Final flush has a deadline: the process exits even if the collector hangs

pub mod shutdown;
pub mod signals;

pub use shutdown::{recv_shutdown, Shutdown};
pub use signals::wait_for_signal;
