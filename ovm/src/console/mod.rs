//! Console subsystem: multiplexer, attach client, and replay buffer.

mod client;
mod listener;
mod replay;

pub use client::{ConsoleClient, ConsoleConnectionError, DETACH_BYTE};
pub use listener::{ConsoleListener, ConsoleListenerError};
pub use replay::{AnsiStripper, REPLAY_CAPACITY, ReplayBuffer, strip_ansi};
