//! Single-threaded runtime for the echo server.
//!
//! - `BufferPool`: owned read/write buffers released on drop
//! - `Connection`: per-connection read→write state machine
//! - `Listener`: accepts connections and arms reading
//! - `event_loop`: the mio poll loop tying them together

mod buffer;
mod connection;
pub(crate) mod event_loop;
mod listener;

pub use buffer::{BufferPool, PoolStats, PooledBuffer};
pub use connection::{ConnState, Connection, Progress, ReadStatus};
pub(crate) use listener::Listener;
