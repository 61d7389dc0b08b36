//! svchost capture engine: carries a process's stdout/stderr over a local
//! socket into a diagnostics sink, one record per line.
//!
//! Public API surface:
//! - [`channel`]: the per-run socket, client connect, std stream redirection
//! - [`endpoint`]: one connection's non-blocking state machine
//! - [`multiplexer`]: the capture thread's `poll` loop
//! - [`reassembler`]: line splitting over a fixed buffer
//! - [`event`]: pollable manual-reset events
//! - [`error`]: [`CaptureError`]

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod multiplexer;
pub mod reassembler;

pub use channel::{channel_name, CaptureChannel, StdStream, StreamRedirect};
pub use error::CaptureError;
pub use event::{Event, SetOnDrop};
pub use multiplexer::{CaptureOptions, Cycle, Mirror, Multiplexer};
